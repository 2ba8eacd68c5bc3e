//! `meson-hierbitmap` — layer geometry of the hierarchical bitmap.
//!
//! A hierarchical bitmap tracks N leaf bits plus a pyramid of summary
//! layers: a bit in layer k is 1 iff all `fanout` of its children in layer
//! k−1 are 1. Finding a free leaf is then a logarithmic descent — scan one
//! word per layer — instead of a linear sweep.
//!
//! Two consumers share this geometry with very different storage:
//! the physical memory manager keeps the whole pyramid in RAM and mutates
//! it with 64-bit CAS, while the filesystem keeps it on disk and reads one
//! bitmap block per descent step. Both layouts are represented here:
//!
//! * [`LayerGeometry::bottom_up`] — leaf layer first (bit offset 0), every
//!   layer's bit offset aligned to the fanout so whole words never straddle
//!   a layer boundary. Used by the PMM.
//! * [`LayerGeometry::top_down`] — topmost (smallest) layer first, the way
//!   the on-disk format stores it so the top layer can be cached from the
//!   first bitmap block. Used by the filesystem.
//!
//! Layer index 0 is always the leaf layer regardless of construction; the
//! spans record where each layer physically lives.

#![cfg_attr(not(test), no_std)]

/// Upper bound on pyramid depth.
///
/// Seven layers of fanout 64 already cover 16 PB of 4 KiB frames; the disk
/// variant with fanout 8 needs more headroom.
pub const MAX_LAYERS: usize = 16;

/// The physical placement of one bitmap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayerSpan {
    /// Bit offset of this layer from the start of the bitmap.
    pub start_bit: u64,
    /// Number of bits in this layer.
    pub size_bits: u64,
}

/// Errors from geometry construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// The fanout is not a power of two, or is zero.
    BadFanout,
    /// The leaf layer is empty.
    EmptyLeafLayer,
    /// The pyramid would exceed [`MAX_LAYERS`].
    TooDeep,
}

/// Layer placement of a hierarchical bitmap.
///
/// Index 0 is the leaf layer; index `count() - 1` is the topmost summary
/// layer.
#[derive(Debug, Clone, Copy)]
pub struct LayerGeometry {
    layers: [LayerSpan; MAX_LAYERS],
    count: usize,
    fanout: u64,
    /// Total occupied bits, including inter-layer alignment padding.
    total_bits: u64,
}

impl LayerGeometry {
    /// Builds the in-memory (PMM) layout: leaf layer at bit 0, parent
    /// layers following, each layer's start aligned to `fanout` bits and
    /// each layer's size padded to a `fanout` multiple. Construction stops
    /// once a layer fits in a single `fanout`-bit group, or at
    /// `max_layers`.
    pub fn bottom_up(leaf_bits: u64, fanout: u64, max_layers: usize) -> Result<Self, GeometryError> {
        if fanout == 0 || !fanout.is_power_of_two() {
            return Err(GeometryError::BadFanout);
        }
        if leaf_bits == 0 {
            return Err(GeometryError::EmptyLeafLayer);
        }
        if max_layers == 0 || max_layers > MAX_LAYERS {
            return Err(GeometryError::TooDeep);
        }

        let mut layers = [LayerSpan::default(); MAX_LAYERS];
        layers[0] = LayerSpan {
            start_bit: 0,
            size_bits: round_up(leaf_bits, fanout),
        };
        let mut count = 1;

        while count < max_layers {
            let prev = layers[count - 1];
            if prev.size_bits <= fanout {
                break;
            }

            let start_bit = round_up(prev.start_bit + prev.size_bits, fanout);
            let mut size_bits = prev.size_bits / fanout;
            if size_bits > fanout {
                size_bits = round_up(size_bits, fanout);
            }

            layers[count] = LayerSpan {
                start_bit,
                size_bits,
            };
            count += 1;
        }

        let top = layers[count - 1];
        Ok(Self {
            layers,
            count,
            fanout,
            total_bits: top.start_bit + top.size_bits,
        })
    }

    /// Builds the on-disk (filesystem) layout: layers are contiguous with
    /// the topmost first, so the first bitmap block always holds the top
    /// layer. Depth is derived by dividing the leaf size by `fanout` until
    /// a layer fits inside `top_limit` bits.
    ///
    /// Every layer's size is padded to a `fanout` multiple so a child
    /// group never straddles a layer boundary; the consumer marks padding
    /// bits used so they are never handed out.
    pub fn top_down(leaf_bits: u64, fanout: u64, top_limit: u64) -> Result<Self, GeometryError> {
        if fanout == 0 || !fanout.is_power_of_two() {
            return Err(GeometryError::BadFanout);
        }
        if leaf_bits == 0 {
            return Err(GeometryError::EmptyLeafLayer);
        }

        // Depth: shrink until the top layer fits the limit.
        let mut count = 1usize;
        let mut size = leaf_bits;
        while size > top_limit {
            size = size.div_ceil(fanout);
            count += 1;
            if count > MAX_LAYERS {
                return Err(GeometryError::TooDeep);
            }
        }

        // Sizes bottom-up, each padded to a fanout multiple.
        let mut sizes = [0u64; MAX_LAYERS];
        sizes[0] = round_up(leaf_bits, fanout);
        for layer in 1..count {
            sizes[layer] = round_up(sizes[layer - 1] / fanout, fanout).max(fanout);
        }

        // Starts: contiguous, topmost layer at bit 0.
        let mut layers = [LayerSpan::default(); MAX_LAYERS];
        let mut start = 0u64;
        for layer in (0..count).rev() {
            layers[layer] = LayerSpan {
                start_bit: start,
                size_bits: sizes[layer],
            };
            start += sizes[layer];
        }

        Ok(Self {
            layers,
            count,
            fanout,
            total_bits: start,
        })
    }

    /// Number of layers, leaf included.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// The branching factor.
    #[inline]
    pub fn fanout(&self) -> u64 {
        self.fanout
    }

    /// The span of layer `i` (0 = leaf).
    #[inline]
    pub fn layer(&self, i: usize) -> LayerSpan {
        debug_assert!(i < self.count);
        self.layers[i]
    }

    /// Total occupied bits including alignment padding.
    #[inline]
    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    /// Total occupied bytes, rounded up.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        (self.total_bits + 7) / 8
    }

    /// Index of `bit`'s parent in the layer above.
    #[inline]
    pub fn parent_index(&self, bit: u64) -> u64 {
        bit / self.fanout
    }

    /// Index of the first child of `bit` in the layer below.
    #[inline]
    pub fn child_base(&self, bit: u64) -> u64 {
        bit * self.fanout
    }
}

#[inline]
fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_up_single_layer() {
        // 64 leaf bits with fanout 64 need no summary layer.
        let geo = LayerGeometry::bottom_up(64, 64, 7).unwrap();
        assert_eq!(geo.count(), 1);
        assert_eq!(geo.layer(0), LayerSpan { start_bit: 0, size_bits: 64 });
        assert_eq!(geo.total_bits(), 64);
    }

    #[test]
    fn bottom_up_128mib_of_frames() {
        // 128 MiB of 4 KiB frames = 32768 leaf bits.
        let geo = LayerGeometry::bottom_up(32768, 64, 7).unwrap();
        assert_eq!(geo.count(), 3);
        assert_eq!(geo.layer(0).size_bits, 32768);
        assert_eq!(geo.layer(1).start_bit, 32768);
        assert_eq!(geo.layer(1).size_bits, 512);
        assert_eq!(geo.layer(2).start_bit, 33280);
        assert_eq!(geo.layer(2).size_bits, 8);
    }

    #[test]
    fn bottom_up_pads_leaf_to_fanout() {
        let geo = LayerGeometry::bottom_up(100, 64, 7).unwrap();
        assert_eq!(geo.layer(0).size_bits, 128);
        assert_eq!(geo.count(), 2);
        assert_eq!(geo.layer(1).size_bits, 2);
    }

    #[test]
    fn bottom_up_layer_starts_word_aligned() {
        let geo = LayerGeometry::bottom_up(1 << 22, 64, 7).unwrap();
        for i in 0..geo.count() {
            assert_eq!(geo.layer(i).start_bit % 64, 0, "layer {i} not aligned");
        }
    }

    #[test]
    fn bottom_up_rejects_bad_fanout() {
        assert_eq!(
            LayerGeometry::bottom_up(100, 0, 7).unwrap_err(),
            GeometryError::BadFanout
        );
        assert_eq!(
            LayerGeometry::bottom_up(100, 48, 7).unwrap_err(),
            GeometryError::BadFanout
        );
    }

    #[test]
    fn bottom_up_respects_max_layers() {
        // Depth capped at 2 even though the leaf would want more.
        let geo = LayerGeometry::bottom_up(1 << 30, 64, 2).unwrap();
        assert_eq!(geo.count(), 2);
    }

    #[test]
    fn top_down_single_layer_when_small() {
        let geo = LayerGeometry::top_down(1000, 16, 16384).unwrap();
        assert_eq!(geo.count(), 1);
        // Leaf padded to a fanout multiple.
        assert_eq!(geo.layer(0), LayerSpan { start_bit: 0, size_bits: 1008 });
    }

    #[test]
    fn top_down_2g_image_fanout_16() {
        // 2 GiB / 4 KiB blocks = 524288 leaf bits, limit 16384:
        // 524288 -> 32768 -> 2048 (two divisions, three layers).
        let geo = LayerGeometry::top_down(524288, 16, 16384).unwrap();
        assert_eq!(geo.count(), 3);
        // Topmost layer occupies bit 0; lower layers follow contiguously.
        assert_eq!(geo.layer(2).start_bit, 0);
        assert_eq!(geo.layer(2).size_bits, 2048);
        assert_eq!(geo.layer(1).start_bit, 2048);
        assert_eq!(geo.layer(1).size_bits, 32768);
        assert_eq!(geo.layer(0).start_bit, 2048 + 32768);
        assert_eq!(geo.layer(0).size_bits, 524288);
        assert_eq!(geo.total_bits(), 524288 + 32768 + 2048);
    }

    #[test]
    fn top_down_layers_never_overlap() {
        let geo = LayerGeometry::top_down(1_000_000, 8, 4096).unwrap();
        for upper in (1..geo.count()).rev() {
            let above = geo.layer(upper);
            let below = geo.layer(upper - 1);
            assert_eq!(
                above.start_bit + above.size_bits,
                below.start_bit,
                "layer {upper} must end where layer {} begins",
                upper - 1
            );
            assert_eq!(above.size_bits % geo.fanout(), 0);
        }
    }

    #[test]
    fn top_down_parent_child_round_trip() {
        let geo = LayerGeometry::top_down(524288, 16, 16384).unwrap();
        let leaf = 300_000u64;
        let parent = geo.parent_index(leaf);
        assert!(geo.child_base(parent) <= leaf);
        assert!(leaf < geo.child_base(parent) + geo.fanout());
    }

    #[test]
    fn top_down_depth_limit() {
        assert_eq!(
            LayerGeometry::top_down(u64::MAX, 8, 8).unwrap_err(),
            GeometryError::TooDeep
        );
    }

    #[test]
    fn summary_property_arithmetic() {
        // The AND rule relates bit i of layer k to bits
        // [i*fanout, (i+1)*fanout) of layer k-1; spot-check the helpers.
        let geo = LayerGeometry::bottom_up(4096, 64, 7).unwrap();
        assert_eq!(geo.parent_index(4095), 63);
        assert_eq!(geo.child_base(63), 4032);
    }
}

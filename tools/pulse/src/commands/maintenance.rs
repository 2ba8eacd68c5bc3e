//! `info`, `sync`, `check`, and `repair`.

use crate::cli::{ESC_BOLD, ESC_BOLD_CYAN, ESC_BOLD_GREEN, ESC_BOLD_RED, ESC_RESET};
use crate::commands::{Session, human_size};
use crate::fs::inode::now_ns;

/// `info` — prints the mounted volume's superblock.
pub fn info_command(session: &mut Session, _args: &[String]) -> i32 {
    let Some(mountpoint) = &session.mountpoint else {
        println!("{ESC_BOLD_RED}info:{ESC_RESET} nothing is mounted");
        return 1;
    };

    let sb = &mountpoint.superblock;
    println!("{ESC_BOLD_CYAN}{}{ESC_RESET}", mountpoint.name);
    println!(
        "  {ESC_BOLD}revision:{ESC_RESET}      {}.{}.{}",
        sb.major_revision, sb.minor_revision, sb.patch
    );
    println!(
        "  {ESC_BOLD}uuid:{ESC_RESET}          {:016x}{:016x}",
        sb.uuid[0], sb.uuid[1]
    );
    println!(
        "  {ESC_BOLD}volume size:{ESC_RESET}   {} blocks ({})",
        sb.volume_size,
        human_size(sb.volume_size * u64::from(mountpoint.block_size))
    );
    println!("  {ESC_BOLD}block size:{ESC_RESET}    {}", mountpoint.block_size);
    println!("  {ESC_BOLD}fanout:{ESC_RESET}        {}", mountpoint.fanout);
    println!(
        "  {ESC_BOLD}bitmap:{ESC_RESET}        block {}, {} layers, leaf limit {}",
        sb.bitmap_block,
        mountpoint.layers.count(),
        mountpoint.bitmap_limit
    );
    println!("  {ESC_BOLD}root inode:{ESC_RESET}    {}", sb.root_inode);
    println!("  {ESC_BOLD}total mounts:{ESC_RESET}  {}", sb.total_mounts);
    println!("  {ESC_BOLD}label:{ESC_RESET}         \"{}\"", sb.label_str());
    0
}

/// `sync` — flush the image and stamp the write time.
pub fn sync_command(session: &mut Session, _args: &[String]) -> i32 {
    let Some(mountpoint) = &mut session.mountpoint else {
        println!("{ESC_BOLD_RED}sync:{ESC_RESET} nothing is mounted");
        return 1;
    };

    mountpoint.superblock.last_write_time = now_ns();
    match mountpoint.write_superblock().and_then(|()| mountpoint.sync()) {
        Ok(()) => {
            println!("{ESC_BOLD_GREEN}sync:{ESC_RESET} ✅ flushed {}", mountpoint.name);
            0
        }
        Err(err) => {
            println!("{ESC_BOLD_RED}sync:{ESC_RESET} {err}");
            1
        }
    }
}

/// `check` — validate the superblock checksum and the bitmap hierarchy.
pub fn check_command(session: &mut Session, _args: &[String]) -> i32 {
    let Some(mountpoint) = &mut session.mountpoint else {
        println!("{ESC_BOLD_RED}check:{ESC_RESET} nothing is mounted");
        return 1;
    };

    if let Err(err) = mountpoint.superblock.verify_checksum() {
        println!("{ESC_BOLD_RED}check:{ESC_RESET} {err}");
        return 1;
    }
    println!("{ESC_BOLD_CYAN}check:{ESC_RESET} superblock checksum ok");

    match mountpoint.check_bitmap() {
        Ok(0) => {
            mountpoint.superblock.last_check_time = now_ns();
            let _ = mountpoint.write_superblock();
            println!("{ESC_BOLD_GREEN}check:{ESC_RESET} ✅ bitmap hierarchy consistent");
            0
        }
        Ok(violations) => {
            println!(
                "{ESC_BOLD_RED}check:{ESC_RESET} {violations} bitmap summary violation(s); run 'repair'"
            );
            1
        }
        Err(err) => {
            println!("{ESC_BOLD_RED}check:{ESC_RESET} {err}");
            1
        }
    }
}

/// `repair` — rebuild the bitmap summary layers from the leaf layer.
pub fn repair_command(session: &mut Session, _args: &[String]) -> i32 {
    let Some(mountpoint) = &mut session.mountpoint else {
        println!("{ESC_BOLD_RED}repair:{ESC_RESET} nothing is mounted");
        return 1;
    };

    match mountpoint.repair_bitmap() {
        Ok(repaired) => {
            mountpoint.superblock.last_check_time = now_ns();
            let _ = mountpoint.write_superblock();
            println!(
                "{ESC_BOLD_GREEN}repair:{ESC_RESET} ✅ rebuilt summary layers ({repaired} bit(s) fixed)"
            );
            0
        }
        Err(err) => {
            println!("{ESC_BOLD_RED}repair:{ESC_RESET} {err}");
            1
        }
    }
}

//! `create` and `format`.

use std::path::Path;

use crate::cli::{ESC_BOLD_CYAN, ESC_BOLD_GREEN, ESC_BOLD_RED, ESC_RESET};
use crate::commands::{Session, human_size, parse_size};
use crate::fs::format::format;
use crate::fs::superblock::{DEFAULT_BLOCK_SIZE, DEFAULT_FANOUT};

const DEFAULT_SIZE: u64 = 10 * 1024 * 1024;

/// `create [-m|--mount] <image> [size] [blocksize] [fanout]`
pub fn create_command(session: &mut Session, args: &[String]) -> i32 {
    if args.len() < 2 || args.len() > 6 {
        println!(
            "{ESC_BOLD_CYAN}usage:{ESC_RESET} create [-m|--mount] <image> [size=10m] [blocksize=4096] [fanout=16]"
        );
        println!("{ESC_BOLD_CYAN}example:{ESC_RESET} create -m /path/to/image.hdd 50G");
        return 1;
    }

    let mount_after = args[1] == "-m" || args[1] == "--mount";
    if mount_after && session.mountpoint.is_some() {
        let name = session.mountpoint.as_ref().map(|m| m.name.clone()).unwrap_or_default();
        println!("{ESC_BOLD_RED}create:{ESC_RESET} unmount {name} first");
        return 1;
    }

    let base = if mount_after { 2 } else { 1 };
    let Some(image) = args.get(base) else {
        println!("{ESC_BOLD_RED}create:{ESC_RESET} missing image path");
        return 1;
    };

    let size = match args.get(base + 1) {
        Some(text) => match parse_size(text) {
            Some(size) if size > 0 => size,
            _ => {
                println!("{ESC_BOLD_RED}create:{ESC_RESET} invalid size {text}");
                return 1;
            }
        },
        None => DEFAULT_SIZE,
    };
    let block_size = match args.get(base + 2) {
        Some(text) => match text.parse::<u32>() {
            Ok(bs) => bs,
            Err(_) => {
                println!("{ESC_BOLD_RED}create:{ESC_RESET} invalid block size {text}");
                return 1;
            }
        },
        None => DEFAULT_BLOCK_SIZE,
    };
    let fanout = match args.get(base + 3) {
        Some(text) => match text.parse::<u64>() {
            Ok(f) => f,
            Err(_) => {
                println!("{ESC_BOLD_RED}create:{ESC_RESET} invalid fanout {text}");
                return 1;
            }
        },
        None => DEFAULT_FANOUT,
    };

    println!(
        "{ESC_BOLD_CYAN}create:{ESC_RESET} creating disk image {image} with size {}",
        human_size(size)
    );

    match format(Path::new(image), size, block_size, fanout) {
        Ok(report) => {
            println!(
                "    🛠️  built {} bitmap layer{} with fanout factor {fanout}",
                report.layer_count,
                if report.layer_count == 1 { "" } else { "s" }
            );
            println!(
                "    🛠️  wrote {} blocks of bitmap data, root directory at inode {}",
                report.bitmap_blocks, report.root_inode
            );
            println!(
                "    ✅ formatted {image}: {} in {} blocks, overhead {} ({:.2}%)",
                human_size(size),
                report.block_count,
                human_size(report.overhead_bytes),
                report.overhead_bytes as f64 * 100.0 / size as f64
            );
        }
        Err(err) => {
            println!("{ESC_BOLD_RED}create:{ESC_RESET} failed to create {image}: {err}");
            return 1;
        }
    }

    if mount_after {
        let mount_args = vec!["mount".to_owned(), image.clone()];
        let status = super::mount::mount_command(session, &mount_args);
        if status != 0 {
            println!("{ESC_BOLD_RED}create:{ESC_RESET} failed to mount {image}");
            return status;
        }
    }

    println!("{ESC_BOLD_GREEN}create:{ESC_RESET} ✅ created disk image {image}");
    0
}

/// `format <image> [blocksize] [fanout]` — reformats an existing image in
/// place, keeping its current size.
pub fn format_command(session: &mut Session, args: &[String]) -> i32 {
    if args.len() < 2 || args.len() > 4 {
        println!("{ESC_BOLD_CYAN}usage:{ESC_RESET} format <image> [blocksize=4096] [fanout=16]");
        return 1;
    }
    let image = &args[1];

    let image_name = Path::new(image)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if session.mountpoint.as_ref().is_some_and(|m| m.name == image_name) {
        println!("{ESC_BOLD_RED}format:{ESC_RESET} unmount {image} first");
        return 1;
    }

    let size = match std::fs::metadata(image) {
        Ok(meta) => meta.len(),
        Err(err) => {
            println!("{ESC_BOLD_RED}format:{ESC_RESET} cannot stat {image}: {err}");
            return 1;
        }
    };

    let block_size = args
        .get(2)
        .and_then(|t| t.parse().ok())
        .unwrap_or(DEFAULT_BLOCK_SIZE);
    let fanout = args
        .get(3)
        .and_then(|t| t.parse().ok())
        .unwrap_or(DEFAULT_FANOUT);

    match format(Path::new(image), size, block_size, fanout) {
        Ok(_) => {
            println!("{ESC_BOLD_GREEN}format:{ESC_RESET} ✅ formatted {image}");
            0
        }
        Err(err) => {
            println!("{ESC_BOLD_RED}format:{ESC_RESET} failed: {err}");
            1
        }
    }
}

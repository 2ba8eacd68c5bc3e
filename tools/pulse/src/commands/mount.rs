//! `mount` and `umount`.

use std::path::Path;

use crate::cli::{ESC_BOLD_CYAN, ESC_BOLD_GREEN, ESC_BOLD_RED, ESC_RESET};
use crate::commands::Session;
use crate::fs::Mountpoint;
use crate::fs::inode::now_ns;

/// `mount <image>`
pub fn mount_command(session: &mut Session, args: &[String]) -> i32 {
    if args.len() != 2 {
        println!("{ESC_BOLD_CYAN}usage:{ESC_RESET} mount <image>");
        println!("{ESC_BOLD_CYAN}example:{ESC_RESET} mount /path/to/image.hdd");
        return 1;
    }

    if let Some(mounted) = &session.mountpoint {
        println!("{ESC_BOLD_RED}mount:{ESC_RESET} unmount {} first", mounted.name);
        return 1;
    }

    let image = &args[1];
    println!("{ESC_BOLD_CYAN}mount:{ESC_RESET} mounting disk image {image}");

    match Mountpoint::mount(Path::new(image)) {
        Ok(mut mountpoint) => {
            // Record the mount in the superblock.
            mountpoint.superblock.last_mount_time = now_ns();
            mountpoint.superblock.total_mounts += 1;
            if let Err(err) = mountpoint.write_superblock() {
                println!("{ESC_BOLD_RED}mount:{ESC_RESET} failed to update superblock: {err}");
                return 1;
            }
            println!("{ESC_BOLD_GREEN}mount:{ESC_RESET} ✅ mounted disk image {image}");
            session.mountpoint = Some(mountpoint);
            0
        }
        Err(err) => {
            println!("{ESC_BOLD_RED}mount:{ESC_RESET} {err}");
            1
        }
    }
}

/// `umount`
pub fn umount_command(session: &mut Session, _args: &[String]) -> i32 {
    let Some(mut mountpoint) = session.mountpoint.take() else {
        println!("{ESC_BOLD_RED}umount:{ESC_RESET} nothing is mounted");
        return 1;
    };

    mountpoint.superblock.last_write_time = now_ns();
    if let Err(err) = mountpoint
        .write_superblock()
        .and_then(|()| mountpoint.sync())
    {
        println!("{ESC_BOLD_RED}umount:{ESC_RESET} {err}");
        return 1;
    }
    println!("{ESC_BOLD_GREEN}umount:{ESC_RESET} ✅ unmounted {}", mountpoint.name);
    0
}

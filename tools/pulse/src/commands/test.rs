//! `test` — the built-in self-test suite.
//!
//! Exercises the whole stack against a scratch image: create, mount,
//! allocator linearity (consecutive block numbers, free-then-realloc
//! returns the same block), and a root-inode dump.

use crate::cli::{ESC_BOLD_CYAN, ESC_BOLD_GREEN, ESC_BOLD_RED, ESC_RESET};
use crate::commands::Session;

struct SelfTest {
    name: &'static str,
    description: &'static str,
    run: fn(&mut Session) -> Result<(), String>,
}

static TESTS: &[SelfTest] = &[
    SelfTest {
        name: "create",
        description: "creating new disk image",
        run: test_create,
    },
    SelfTest {
        name: "mount",
        description: "mounting disk image",
        run: test_mount,
    },
    SelfTest {
        name: "allocate",
        description: "allocating blocks",
        run: test_allocate,
    },
    SelfTest {
        name: "dumproot",
        description: "dumping root inode",
        run: test_dump_root,
    },
];

fn test_create(session: &mut Session) -> Result<(), String> {
    std::fs::create_dir_all("test").map_err(|e| e.to_string())?;
    let args: Vec<String> = ["create", "test/test.img", "2g"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    match super::create::create_command(session, &args) {
        0 => Ok(()),
        status => Err(format!("create exited with {status}")),
    }
}

fn test_mount(session: &mut Session) -> Result<(), String> {
    let args: Vec<String> = ["mount", "test/test.img"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    match super::mount::mount_command(session, &args) {
        0 => Ok(()),
        status => Err(format!("mount exited with {status}")),
    }
}

fn test_allocate(session: &mut Session) -> Result<(), String> {
    let Some(mountpoint) = &mut session.mountpoint else {
        return Err("no mounted volume".to_owned());
    };

    let test_count = (mountpoint.fanout * 256) as usize;
    println!("{ESC_BOLD_CYAN}test:{ESC_RESET} running {test_count} allocation tests...");

    let mut expected = None;
    let mut victims = Vec::new();
    for i in 0..test_count {
        let block = mountpoint
            .allocate_block()
            .map_err(|e| format!("allocation failed: {e}"))?;
        if let Some(expected) = expected {
            if block != expected {
                return Err(format!("allocated block {block} but expected {expected}"));
            }
        }
        expected = Some(block + 1);
        // Spread a few free/realloc probes across the run.
        if i % 1000 == 500 {
            victims.push(block);
        }
    }

    for victim in victims {
        println!("    🛠️ freeing and reallocating block {victim}");
        mountpoint
            .free_block(victim)
            .map_err(|e| format!("free failed: {e}"))?;
        let again = mountpoint
            .allocate_block()
            .map_err(|e| format!("realloc failed: {e}"))?;
        if again != victim {
            return Err(format!("reallocated block {again} but expected {victim}"));
        }
    }
    Ok(())
}

fn test_dump_root(session: &mut Session) -> Result<(), String> {
    let Some(mountpoint) = &mut session.mountpoint else {
        return Err("no mounted volume".to_owned());
    };
    let root = mountpoint.resolve("/").map_err(|e| e.to_string())?;
    let inode = mountpoint.read_inode(root).map_err(|e| e.to_string())?;

    println!("{ESC_BOLD_CYAN}Inode {}{ESC_RESET}", inode.number);
    println!("  mode: {:#06x}", inode.mode);
    println!("  links: {}", inode.link_count);
    println!("  size: {} bytes (inline {})", inode.size, inode.inline_len());
    println!("  extent tree root: {}", inode.extent_tree_root);
    Ok(())
}

/// `test`
pub fn test_command(session: &mut Session, _args: &[String]) -> i32 {
    println!("{ESC_BOLD_CYAN}test:{ESC_RESET} running tests...");

    let mut failures = 0usize;
    for test in TESTS {
        println!(
            "{ESC_BOLD_CYAN}test:{ESC_RESET} 🔄 running test {} - {}",
            test.name, test.description
        );
        match (test.run)(session) {
            Ok(()) => {
                println!("{ESC_BOLD_GREEN}test:{ESC_RESET} ✅ test {} passed", test.name);
            }
            Err(reason) => {
                println!(
                    "{ESC_BOLD_RED}test:{ESC_RESET} ⚠️ test {} failed: {reason}",
                    test.name
                );
                failures += 1;
            }
        }
    }

    if failures > 0 {
        println!(
            "{ESC_BOLD_RED}test:{ESC_RESET} ❌ {failures}/{} tests failed",
            TESTS.len()
        );
        1
    } else {
        println!(
            "{ESC_BOLD_GREEN}test:{ESC_RESET} ✅ {}/{} tests passed",
            TESTS.len(),
            TESTS.len()
        );
        0
    }
}

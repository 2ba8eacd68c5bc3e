//! Interactive command line.
//!
//! A colored REPL with a status prompt, "did you mean" suggestions for
//! typos, and a double-SIGINT exit: the first Ctrl+C warns, a second one
//! within the same prompt cycle quits.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::commands::{self, Session};

/// ANSI reset.
pub const ESC_RESET: &str = "\x1b[0m";
/// ANSI bold.
pub const ESC_BOLD: &str = "\x1b[1m";
/// ANSI bold red.
pub const ESC_BOLD_RED: &str = "\x1b[1;31m";
/// ANSI bold green.
pub const ESC_BOLD_GREEN: &str = "\x1b[1;32m";
/// ANSI bold yellow.
pub const ESC_BOLD_YELLOW: &str = "\x1b[1;33m";
/// ANSI bold blue.
pub const ESC_BOLD_BLUE: &str = "\x1b[1;34m";
/// ANSI bold cyan.
pub const ESC_BOLD_CYAN: &str = "\x1b[1;36m";

/// Maximum arguments per command line.
const MAX_ARGS: usize = 8;

/// A CLI command.
pub struct Command {
    /// Command name.
    pub name: &'static str,
    /// One-line description for `help`.
    pub description: &'static str,
    /// Implementation; returns the exit status (0 = success).
    pub run: fn(&mut Session, &[String]) -> i32,
}

/// The command table.
pub static COMMANDS: &[Command] = &[
    Command {
        name: "exit",
        description: "exit the command line interface",
        run: |_, _| std::process::exit(0),
    },
    Command {
        name: "help",
        description: "show this help message",
        run: help_command,
    },
    Command {
        name: "mount",
        description: "mount a disk image",
        run: commands::mount::mount_command,
    },
    Command {
        name: "umount",
        description: "unmount a disk image",
        run: commands::mount::umount_command,
    },
    Command {
        name: "create",
        description: "create a new disk image",
        run: commands::create::create_command,
    },
    Command {
        name: "format",
        description: "format a disk image",
        run: commands::create::format_command,
    },
    Command {
        name: "info",
        description: "show information about a mounted image",
        run: commands::maintenance::info_command,
    },
    Command {
        name: "sync",
        description: "sync the file system to the disk image",
        run: commands::maintenance::sync_command,
    },
    Command {
        name: "check",
        description: "check the file system for errors",
        run: commands::maintenance::check_command,
    },
    Command {
        name: "repair",
        description: "repair the file system",
        run: commands::maintenance::repair_command,
    },
    Command {
        name: "test",
        description: "run the self-test suite",
        run: commands::test::test_command,
    },
];

fn help_command(_session: &mut Session, _args: &[String]) -> i32 {
    let longest = COMMANDS.iter().map(|c| c.name.len()).max().unwrap_or(0) + 2;
    println!(" ⚙️  available commands:");
    for command in COMMANDS {
        println!(
            "   {ESC_BOLD}{:<longest$}{ESC_RESET}{}",
            command.name, command.description
        );
    }
    0
}

// ---------------------------------------------------------------------------
// SIGINT: warn once, exit on the second within a prompt cycle
// ---------------------------------------------------------------------------

static SIGNALED: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_signal: libc::c_int) {
    if SIGNALED.swap(true, Ordering::SeqCst) {
        // Second Ctrl+C before the next command: quit.
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(0) };
    }
    const MESSAGE: &[u8] = b"\n\x1b[1;33mpress ctrl+c again to quit.\x1b[0m\n";
    // SAFETY: write(2) is async-signal-safe; the buffer is static.
    let _ = unsafe { libc::write(libc::STDOUT_FILENO, MESSAGE.as_ptr().cast(), MESSAGE.len()) };
}

/// Installs the double-SIGINT handler.
pub fn install_sigint() {
    let handler = sigint_handler as extern "C" fn(libc::c_int);
    // SAFETY: Installing a handler that only touches an atomic and calls
    // async-signal-safe functions.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

// ---------------------------------------------------------------------------
// Prompt and dispatch
// ---------------------------------------------------------------------------

fn print_prompt(session: &Session, status: i32) {
    if status == 0 {
        print!("{ESC_BOLD_GREEN}✓{ESC_RESET}");
    } else {
        print!("{ESC_BOLD_RED}✗{ESC_RESET}");
    }
    if let Some(mountpoint) = &session.mountpoint {
        print!(" {ESC_BOLD_BLUE}{}{ESC_RESET}", mountpoint.name);
    }
    print!(" {ESC_BOLD_CYAN}⌘{ESC_RESET} ");
    let _ = std::io::stdout().flush();
}

/// Dispatches one tokenized command line. Returns the exit status.
pub fn dispatch(session: &mut Session, args: &[String]) -> i32 {
    let Some(name) = args.first() else {
        return 0;
    };
    match COMMANDS.iter().find(|c| c.name == name.as_str()) {
        Some(command) => (command.run)(session, args),
        None => {
            not_found(name);
            1
        }
    }
}

fn not_found(command: &str) {
    let closest = COMMANDS
        .iter()
        .map(|c| (levenshtein(command, c.name), c.name))
        .min();
    match closest {
        Some((distance, name)) if distance <= 2 => {
            println!("{ESC_BOLD_RED}{command}:{ESC_RESET} command not found, did you mean '{name}'?");
        }
        _ => println!("{ESC_BOLD_RED}{command}:{ESC_RESET} command not found"),
    }
}

/// Classic dynamic-programming edit distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Runs the interactive shell. Never returns except through `exit`.
pub fn repl() -> i32 {
    println!("{ESC_RESET}pulse command-line interface");
    println!("🌍 https://github.com/meson-os/meson");
    println!("❓ type 'help' for a list of commands.");
    println!();
    println!("{ESC_BOLD_GREEN}💡 tip: {ESC_RESET}start by mounting a disk image or creating one.");
    println!();

    let mut session = Session::default();
    let mut status = 0;
    let mut first_run = true;
    let stdin = std::io::stdin();

    loop {
        if first_run {
            first_run = false;
            print!("{ESC_BOLD_CYAN}⌘{ESC_RESET} ");
            let _ = std::io::stdout().flush();
        } else {
            print_prompt(&session, status);
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return status,
            Ok(_) => {}
            Err(_) => return 1,
        }
        SIGNALED.store(false, Ordering::SeqCst);

        let args: Vec<String> = line
            .split_whitespace()
            .take(MAX_ARGS)
            .map(str::to_owned)
            .collect();
        if args.is_empty() {
            continue;
        }
        status = dispatch(&mut session, &args);
    }
}

/// Runs a single command non-interactively.
pub fn run_script(args: &[String]) -> i32 {
    let mut session = Session::default();
    dispatch(&mut session, args)
}

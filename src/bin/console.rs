//! An interactive console that runs arbitrary functions within a target
//! process. Kind of like a debugger, except nothing stays attached
//! between commands.

use lcitk::disasm::OBJDUMP;
use lcitk::error::Error;
use lcitk::remote_call::call_function_in_target;
use lcitk::remote_mem::{process_read, process_write};
use lcitk::symbols::{find_function, find_libc_function};
use lcitk::util::{get_command_output, resolve_process};
use libc::pid_t;
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::process::exit;
use structopt::StructOpt;

const HISTORY_FILE: &str = ".console_history";
const HEXDUMP: &str = "/usr/bin/hexdump";

#[derive(StructOpt)]
#[structopt(
    name = "console",
    about = "Interactively call functions inside a running process."
)]
struct Opt {
    /// Target process: a pid, or [<user>/]exec_name.
    process: String,
}

/// Splits a command line like the shell would, except only double
/// quotes matter: whitespace inside quotes does not separate tokens and
/// the quotes stay part of the token. The state lives here, owned by
/// the command invocation.
struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(line: &'a str) -> Tokenizer<'a> {
        Tokenizer { rest: line }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let s = self.rest.trim_start();
        if s.is_empty() {
            self.rest = s;
            return None;
        }

        let mut in_quotes = false;
        let mut end = s.len();
        for (i, c) in s.char_indices() {
            if c == '"' {
                in_quotes = !in_quotes;
            } else if c.is_whitespace() && !in_quotes {
                end = i;
                break;
            }
        }

        let (token, rest) = s.split_at(end);
        self.rest = rest;
        Some(token)
    }
}

/// Expand C-style escapes in the body of a quoted string.
fn unescape(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.bytes().peekable();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match chars.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'r') => out.push(b'\r'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'x') => {
                let hi = chars.next();
                let lo = chars.next();
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        let pair = [h, l];
                        match u8::from_str_radix(&String::from_utf8_lossy(&pair), 16) {
                            Ok(v) => out.push(v),
                            Err(_) => out.extend_from_slice(&[b'\\', b'x', h, l]),
                        }
                    }
                    _ => out.extend_from_slice(b"\\x"),
                }
            }
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    out
}

/// Parse a numeric literal the way strtol with base 0 does: 0x-prefixed
/// hex, 0-prefixed octal, decimal otherwise, with an optional sign.
fn parse_number(token: &str) -> Option<u64> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let value = if body.starts_with("0x") || body.starts_with("0X") {
        u64::from_str_radix(&body[2..], 16).ok()?
    } else if body.len() > 1 && body.starts_with('0') {
        u64::from_str_radix(&body[1..], 8).ok()?
    } else {
        body.parse::<u64>().ok()?
    };
    Some(if negative {
        (value as i64).wrapping_neg() as u64
    } else {
        value
    })
}

struct Target {
    pid: pid_t,
    malloc: u64,
    free: u64,
}

impl Target {
    fn acquire(specifier: &str) -> lcitk::Result<Target> {
        let pid = resolve_process(specifier)?;
        Ok(Target {
            pid,
            malloc: find_libc_function(pid, "malloc")?,
            free: find_libc_function(pid, "free")?,
        })
    }
}

fn read_command(target: &Target, mut args: Tokenizer) -> lcitk::Result<()> {
    let addr = args
        .next()
        .and_then(parse_number)
        .ok_or_else(|| Error::NotFound("usage: #read <addr> <len>".to_owned()))?;
    let len = args
        .next()
        .and_then(parse_number)
        .ok_or_else(|| Error::NotFound("usage: #read <addr> <len>".to_owned()))?;

    let mut buf = vec![0u8; len as usize];
    process_read(target.pid, &mut buf, addr)?;

    let dump = get_command_output(HEXDUMP, &["-C"], Some(&buf))?;
    io::stdout().write_all(&dump).map_err(Error::RemoteIo)?;
    Ok(())
}

fn call_command(target: &Target, line: &str) -> lcitk::Result<()> {
    let mut tokens = Tokenizer::new(line);
    let func_name = match tokens.next() {
        Some(t) => t,
        None => return Ok(()),
    };

    let mut args: Vec<u64> = Vec::new();
    let mut strings: Vec<u64> = Vec::new();

    for token in tokens {
        if token.starts_with('"') {
            let body = token.trim_start_matches('"').trim_end_matches('"');
            let mut bytes = unescape(body);
            bytes.push(0);

            print!("Allocating string \"{}\" ... ", body);
            let remote = call_function_in_target(target.pid, target.malloc, &[bytes.len() as u64])?;
            process_write(target.pid, &bytes, remote)?;
            println!("{:#x}", remote);

            strings.push(remote);
            args.push(remote);
        } else if let Some(value) = parse_number(token) {
            args.push(value);
        } else {
            // Not a number: resolve it as a symbol of the target.
            let addr = find_function(target.pid, "", token)
                .map(|(a, _)| a)
                .or_else(|_| find_libc_function(target.pid, token))?;
            args.push(addr);
        }
    }

    let lookup = find_function(target.pid, "", func_name)
        .or_else(|_| find_function(target.pid, "/libc", func_name));
    let (function, image_path) = match lookup {
        Ok(found) => found,
        Err(_) => {
            println!("Cannot find function '{}' to call.", func_name);
            return Ok(());
        }
    };

    let rendered: Vec<String> = args.iter().map(|a| format!("{:x}", a)).collect();
    println!(
        "Calling '{}' at {:#x} ({}) with {} arguments ({})...",
        func_name,
        function,
        image_path,
        args.len(),
        rendered.join(", ")
    );

    let ret = call_function_in_target(target.pid, function, &args)?;
    println!(
        "Return value (hex/dec/oct): {:#x} / {} / {:#o}",
        ret, ret, ret
    );

    for addr in strings {
        println!("Freeing string at {:#x}.", addr);
        call_function_in_target(target.pid, target.free, &[addr])?;
    }

    Ok(())
}

fn append_history(line: &str) {
    if let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(HISTORY_FILE)
    {
        let _ = writeln!(f, "{}", line);
    }
}

fn main() {
    env_logger::init();

    let opt = Opt::from_args();
    let mut target = match Target::acquire(&opt.process) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("console: {}", e);
            exit(1);
        }
    };

    if !std::path::Path::new(OBJDUMP).exists() {
        eprintln!("console: warning: {} not found", OBJDUMP);
    }

    println!("Type '#quit' to exit this program.");
    println!();

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let line = match lines.next() {
            Some(Ok(l)) => l,
            _ => break,
        };
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        append_history(&line);

        let result = if line == "#quit" {
            break;
        } else if let Some(spec) = line.strip_prefix("#process ") {
            match Target::acquire(spec.trim()) {
                Ok(t) => {
                    println!("Now targeting process {}.", t.pid);
                    target = t;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else if line.starts_with("#read") {
            let mut args = Tokenizer::new(&line);
            args.next(); // the command itself
            read_command(&target, args)
        } else {
            call_command(&target, &line)
        };

        match result {
            Ok(()) => {}
            Err(e @ Error::TargetCorrupted { .. }) => {
                eprintln!("console: {}", e);
                exit(1);
            }
            Err(e) => eprintln!("console: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_on_whitespace() {
        let toks: Vec<&str> = Tokenizer::new("  foo  bar\tbaz ").collect();
        assert_eq!(toks, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn tokenizer_keeps_quoted_whitespace() {
        let toks: Vec<&str> = Tokenizer::new("call \"hello world\" 42").collect();
        assert_eq!(toks, vec!["call", "\"hello world\"", "42"]);
    }

    #[test]
    fn tokenizer_is_reusable_per_invocation() {
        let line = "a b".to_owned();
        let first: Vec<&str> = Tokenizer::new(&line).collect();
        let second: Vec<&str> = Tokenizer::new(&line).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn numbers_parse_in_all_three_bases() {
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0x2a"), Some(0x2a));
        assert_eq!(parse_number("052"), Some(0o52));
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("-1"), Some(u64::max_value()));
        assert_eq!(parse_number("flotsam"), None);
    }

    #[test]
    fn escapes_unescape() {
        assert_eq!(unescape("a\\tb\\n"), b"a\tb\n");
        assert_eq!(unescape("\\x41\\x00z"), b"A\x00z");
        assert_eq!(unescape("plain"), b"plain");
    }
}

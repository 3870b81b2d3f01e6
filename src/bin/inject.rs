//! Inject a shared library into a running executable, or remove one
//! previously injected.

use lcitk::injection::{inject_so, uninject_so, uninject_so_by_path};
use lcitk::util::resolve_process;
use std::path::PathBuf;
use std::process::exit;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
    name = "inject",
    about = "Inject a shared library into a running process, or remove one."
)]
struct Opt {
    /// Target process: a pid, or [<user>/]exec_name. <user> may be "-"
    /// for any user.
    process: String,

    /// Inject a shared library into the process.
    #[structopt(short = "i", long = "inject", parse(from_os_str))]
    inject: Option<PathBuf>,

    /// Remove a shared library previously injected into the process,
    /// given its hex handle or its path.
    #[structopt(short = "u", long = "uninject")]
    uninject: Option<String>,
}

fn run(opt: &Opt) -> lcitk::Result<()> {
    let pid = resolve_process(&opt.process)?;

    if let Some(path) = &opt.inject {
        let handle = inject_so(pid, path)?;
        println!("Injection returned handle: {:#x}", handle);
        return Ok(());
    }

    if let Some(what) = &opt.uninject {
        let hex = what.trim_start_matches("0x");
        let ret = match u64::from_str_radix(hex, 16) {
            Ok(handle) => uninject_so(pid, handle)?,
            Err(_) => uninject_so_by_path(pid, &PathBuf::from(what))?,
        };
        println!("Uninjection returned: {}", ret);
        return Ok(());
    }

    eprintln!("one of -i or -u must be given");
    exit(2);
}

fn main() {
    env_logger::init();

    let opt = Opt::from_args();
    if let Err(e) = run(&opt) {
        eprintln!("inject: {}", e);
        exit(1);
    }
}

//! unimon CLI tool
//!
//! Boots a flat x86_64 kernel image under the platform hypervisor with the
//! core hypercalls (console write, wall clock) wired to the host.

use std::io::Write;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use unimon::memory::layout;
use unimon::{abi, Monitor};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "run" => cmd_run(&args[2..])?,
        "info" => cmd_info(),
        "help" | "--help" | "-h" => print_usage(&args[0]),
        "version" | "--version" | "-V" => print_version(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage(&args[0]);
            process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!(
        r#"unimon - a unikernel monitor

USAGE:
    {} <COMMAND> [OPTIONS]

COMMANDS:
    run     Boot a kernel image
    info    Show hypervisor information
    help    Show this help message
    version Show version information

RUN OPTIONS:
    --kernel <PATH>     Flat kernel image (required)
    --entry <ADDR>      Load/entry address, hex (default: 0x100000)
    --memory <MB>       Guest memory in MB (default: 128)
    --cmdline <STRING>  Guest command line
"#,
        program
    );
}

fn print_version() {
    println!("unimon {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_info() {
    if unimon::is_supported() {
        println!("Hypervisor: {} (available)", unimon::backend_name().unwrap());
    } else {
        println!("Hypervisor: not available on this platform");
    }
}

fn cmd_run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut kernel = None;
    let mut entry = layout::GUEST_MIN_BASE;
    let mut memory_mb: u32 = 128;
    let mut cmdline = String::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--kernel" => {
                kernel = Some(args.get(i + 1).ok_or("--kernel requires a path")?.clone());
                i += 2;
            }
            "--entry" => {
                let s = args.get(i + 1).ok_or("--entry requires an address")?;
                entry = u64::from_str_radix(s.trim_start_matches("0x"), 16)?;
                i += 2;
            }
            "--memory" => {
                memory_mb = args.get(i + 1).ok_or("--memory requires a size")?.parse()?;
                i += 2;
            }
            "--cmdline" => {
                cmdline = args.get(i + 1).ok_or("--cmdline requires a string")?.clone();
                i += 2;
            }
            other => return Err(format!("unknown option: {}", other).into()),
        }
    }

    let kernel = kernel.ok_or("--kernel is required")?;
    let image = std::fs::read(&kernel)?;

    let mut monitor = Monitor::builder()
        .memory_mb(memory_mb)
        .hypercall(abi::HYPERCALL_PUTS, |mem, gpa| {
            let mut buf = [0u8; abi::PutsParams::SIZE];
            mem.read(gpa, &mut buf)?;
            let params = abi::PutsParams::from_bytes(&buf);
            let data = mem.slice(params.data, params.len)?;
            std::io::stdout().write_all(data)?;
            std::io::stdout().flush()?;
            Ok(())
        })
        .hypercall(abi::HYPERCALL_WALLTIME, |mem, gpa| {
            let nsecs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(std::io::Error::other)?
                .as_nanos() as u64;
            mem.write(gpa, &abi::WalltimeParams { nsecs }.to_bytes())
        })
        .build()?;

    monitor.memory_mut().write(entry, &image)?;
    let kernel_end = entry + image.len() as u64;

    monitor.initialize(entry, kernel_end)?;
    monitor.set_cmdline(&cmdline)?;

    println!(
        "unimon: booting {} ({} bytes at {:#x}, {} MB guest memory)",
        kernel,
        image.len(),
        entry,
        memory_mb
    );
    monitor.run()?;
    println!("unimon: guest halted");
    Ok(())
}

//! Control menu: starts and stops `scan-server` as a background process.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    process::{Child, Command},
};

use anyhow::Context;

fn server_binary() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate current executable")?;
    let dir = exe.parent().context("Executable has no parent directory")?;
    Ok(dir.join("scan-server"))
}

fn start(server: &mut Option<Child>) -> anyhow::Result<()> {
    if let Some(child) = server {
        println!("server already running (pid {})", child.id());
        return Ok(());
    }

    let child = Command::new(server_binary()?)
        .spawn()
        .context("Cannot start scan-server")?;
    println!("server started (pid {})", child.id());
    *server = Some(child);
    Ok(())
}

fn stop(server: &mut Option<Child>) -> anyhow::Result<()> {
    let Some(mut child) = server.take() else {
        println!("server not running");
        return Ok(());
    };

    child.kill().context("Cannot stop scan-server")?;
    let status = child.wait()?;
    println!("server stopped ({status})");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    prefix_scan::telemetry::init();

    let mut server: Option<Child> = None;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        println!();
        println!("  1 - start the scan server");
        println!("  2 - stop the scan server");
        println!("  3 - quit");
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };

        match line?.trim() {
            "1" => start(&mut server)?,
            "2" => stop(&mut server)?,
            "3" => break,
            other => println!("unknown choice {other:?}"),
        }
    }

    stop(&mut server)
}

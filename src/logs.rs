//! `funding-flow logs`: tail one instance's log file.

use std::io::{BufRead, BufReader, Seek};
use std::path::Path;

use anyhow::{Result, bail};

pub fn run(data_dir: &Path, name: &str, lines: usize, follow: bool) -> Result<()> {
    let log_path = data_dir.join("logs").join(format!("{name}.log"));
    if !log_path.exists() {
        bail!(
            "no log file for '{}' at {}. Run `funding-flow ps` to list instances.",
            name,
            log_path.display()
        );
    }

    print_tail(&log_path, lines)?;
    if follow {
        follow_file(&log_path)?;
    }
    Ok(())
}

fn print_tail(path: &Path, n: usize) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(n);
    for line in &all[start..] {
        println!("{line}");
    }
    Ok(())
}

fn follow_file(path: &Path) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    file.seek(std::io::SeekFrom::End(0))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => std::thread::sleep(std::time::Duration::from_millis(250)),
            Ok(_) => print!("{line}"),
            Err(err) => bail!("reading log: {err}"),
        }
    }
}

// Copyright 2026 the Basalt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Build automation for the workspace.
// Run with: cargo xtask <command>

use std::process::Command;
use std::time::Instant;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";

fn print_help() {
    println!("{BOLD}Usage:{RESET} cargo xtask <command>\n");
    println!("Available commands:");
    println!("  {BOLD}build{RESET}   - Build all crates");
    println!("  {BOLD}test{RESET}    - Run all tests");
    println!("  {BOLD}check{RESET}   - Run cargo check on all crates");
    println!("  {BOLD}format{RESET}  - Format all code");
    println!("  {BOLD}clippy{RESET}  - Run clippy on all crates");
    println!("  {BOLD}all{RESET}     - Run format, clippy, build, and test");
}

fn run(name: &str, args: &[&str]) -> bool {
    println!("\n{BOLD}{CYAN}━━━ {name} ━━━{RESET}");
    println!("  cargo {}", args.join(" "));
    let start = Instant::now();
    let status = Command::new("cargo").args(args).status();
    let elapsed = start.elapsed();
    match status {
        Ok(status) if status.success() => {
            println!("{BOLD}{GREEN}✓ {name} finished in {elapsed:.2?}{RESET}");
            true
        }
        Ok(status) => {
            println!(
                "{BOLD}{RED}✗ {name} failed with {status} after {elapsed:.2?}{RESET}"
            );
            false
        }
        Err(err) => {
            println!("{BOLD}{RED}✗ failed to launch cargo: {err}{RESET}");
            false
        }
    }
}

fn main() {
    let command = std::env::args().nth(1).unwrap_or_default();
    let ok = match command.as_str() {
        "build" => run("Build", &["build", "--workspace"]),
        "test" => run("Test", &["test", "--workspace"]),
        "check" => run("Check", &["check", "--workspace", "--all-targets"]),
        "format" => run("Format", &["fmt", "--all"]),
        "clippy" => run(
            "Clippy",
            &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
        ),
        "all" => {
            run("Format", &["fmt", "--all"])
                && run(
                    "Clippy",
                    &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
                )
                && run("Build", &["build", "--workspace"])
                && run("Test", &["test", "--workspace"])
        }
        _ => {
            print_help();
            return;
        }
    };
    if !ok {
        std::process::exit(1);
    }
}

//! Headless capture driver (`--collect`).
//!
//! Prints a short banner, keeps a live event counter on the terminal, and
//! writes the trace file when the operator interrupts the capture.

use std::io::Write;
use std::time::Duration;

use log::error;

use crate::display::sigint_received;
use crate::error::ProcmonError;
use crate::session::Session;

pub struct Headless<'a> {
    session: &'a Session,
}

impl<'a> Headless<'a> {
    pub fn new(session: &'a Session) -> Self {
        Headless { session }
    }

    pub fn run(&self) -> Result<(), ProcmonError> {
        let config = self.session.config();

        println!("Press Ctrl-C to end monitoring without terminating the process.");
        println!();

        print!("PID filter: ");
        if config.pids.is_empty() {
            println!("all pids");
        } else {
            println!(
                "{}",
                config
                    .pids
                    .iter()
                    .map(i32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        print!("Syscall filter: ");
        if config.events.len() == self.session.syscall_universe_len() {
            println!("all syscalls");
        } else {
            println!("{}", config.events.join(", "));
        }
        println!();

        print!("Events captured: ");
        let mut last_printed = 0usize;
        loop {
            if sigint_received() {
                self.session.suspend();
                break;
            }

            let size = self
                .session
                .storage()
                .size()
                .map(|n| n.to_string())
                .unwrap_or_else(|_| "?".to_string());
            // Rewind over the previous counter so it updates in place.
            print!("{}{size}", "\u{8}".repeat(last_printed));
            last_printed = size.len();
            let _ = std::io::stdout().flush();

            std::thread::sleep(Duration::from_millis(1000));
        }
        println!();
        println!();
        Ok(())
    }

    pub fn shutdown(&self) -> Result<(), ProcmonError> {
        let config = self.session.config();
        println!("Writing events to {}", config.output_trace_path.display());

        if let Err(err) = self.session.export() {
            error!("{err}");
            eprintln!(
                "Failed to write trace file {}",
                config.output_trace_path.display()
            );
            return Err(err.into());
        }

        println!(
            "Total events captured: {}",
            self.session.storage().size().unwrap_or(0)
        );
        let lost = self.session.lost_records();
        if lost > 0 {
            println!("Lost {lost} events.");
        }

        if let Ok(aggregates) = self.session.storage().aggregate() {
            let mut top: Vec<_> = aggregates.into_iter().collect();
            top.sort_by(|a, b| b.1 .0.cmp(&a.1 .0));
            if !top.is_empty() {
                println!();
                println!("{:<22} {:>10} {:>16}", "SYSCALL", "COUNT", "TOTAL NS");
                for (syscall, (count, duration)) in top.into_iter().take(10) {
                    println!("{syscall:<22} {count:>10} {duration:>16}");
                }
            }
        }
        Ok(())
    }
}

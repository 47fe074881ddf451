use std::fs::File;
use std::sync::Arc;

use clap::Parser;
use env_logger::Target;
use log::LevelFilter;

use procmon::cli;
use procmon::config::ProcmonConfig;
use procmon::display;
use procmon::display::headless::Headless;
use procmon::error::ProcmonError;
use procmon::schema::SyscallTable;
use procmon::session::Session;
use procmon::storage::sqlite::Sqlite3StorageEngine;
use procmon::storage::StorageEngine;

fn main() {
    // The probe needs CAP_SYS_ADMIN and tracefs; insist on root up front.
    if !nix::unistd::geteuid().is_root() {
        eprintln!("procmon requires elevated credentials. Please run with sudo.");
        std::process::exit(-1);
    }

    let opt = cli::Opt::parse();
    init_logging(&opt);

    if let Err(err) = run(&opt) {
        log::error!("{err}");
        eprintln!("procmon: {err}");
        std::process::exit(-1);
    }
}

fn init_logging(opt: &cli::Opt) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = &opt.log {
        match File::create(path) {
            Ok(file) => {
                builder
                    .target(Target::Pipe(Box::new(file)))
                    .filter_level(LevelFilter::Debug);
            }
            Err(err) => eprintln!("could not open log file {}: {err}", path.display()),
        }
    }
    builder.init();
}

fn run(opt: &cli::Opt) -> Result<(), ProcmonError> {
    let table = Arc::new(SyscallTable::collect()?);
    let config = ProcmonConfig::from_opt(opt, &table)?;
    let storage: Arc<dyn StorageEngine> = Arc::new(Sqlite3StorageEngine::new());

    display::install_sigint_handler();

    if config.trace_file.is_some() {
        let session = Session::open_snapshot(config, storage, table.clone())?;
        return display::viewer::run_snapshot(&session, &table);
    }

    let headless = config.headless;
    let mut session = Session::start_capture(config, storage, table.clone())?;

    let run_result = if headless {
        Headless::new(&session).run()
    } else {
        display::viewer::run_stream(&session, &table)
    };

    // Stop before exporting so the export sees a fully drained pipeline.
    session.stop();
    run_result?;

    if headless {
        Headless::new(&session).shutdown()?;
    }
    Ok(())
}

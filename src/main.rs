use std::process::ExitCode;

use log::{error, info};

use depot::config::Config;
use depot::logger;
use depot::server::Server;

fn main() -> ExitCode {
    let config = match Config::from_args() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = logger::init(config.log_level.to_filter(), config.log_file.as_deref()) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = std::fs::create_dir_all(&config.document_root) {
        error!(root:% = config.document_root.display(); "can't create document root: {err}");
        logger::flush();
        return ExitCode::FAILURE;
    }

    info!(
        port = config.port,
        threads = config.thread_count,
        document_root:% = config.document_root.display();
        "starting depot",
    );

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!("failed to start: {err}");
            logger::flush();
            return ExitCode::FAILURE;
        }
    };

    let result = server.run();
    match result {
        Ok(()) => {
            logger::flush();
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("fatal server error: {err}");
            logger::flush();
            ExitCode::FAILURE
        }
    }
}

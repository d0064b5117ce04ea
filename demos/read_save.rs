use savefs::{IntegrityCheckLevel, OpenOptions, Savefile};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::{Format, Severity};
use sloggers::Build;

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.format(Format::Full);
    let logger = match builder.build() {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("unable to build logger: {}", e);
            return 1;
        }
    };

    let path = std::env::args().nth(1).unwrap_or_else(|| "save.bin".to_string());
    let mut options = OpenOptions::new();
    options.integrity_check_level(IntegrityCheckLevel::WarnOnInvalid);

    let save = match Savefile::open_with_logger(&path, &options, logger.clone()) {
        Ok(save) => save,
        Err(e) => {
            slog::crit!(logger, "{}", e);
            return 1;
        }
    };

    for file in save.files() {
        slog::info!(logger, "{}", file.info.full_path; "size" => file.file_size);
    }
    match save.verify(&mut ()) {
        Ok(report) => slog::info!(logger, "Verified"; "report" => ?report),
        Err(e) => {
            slog::error!(logger, "{}", e);
            return 1;
        }
    }

    0
}

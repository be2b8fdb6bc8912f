use clap::Parser;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use rusty_hgt_contours::conf::Config;
use rusty_hgt_contours::run;

fn main() {
    let mut config = match Config::try_parse() {
        Ok(config) => config,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Warn);
    let _ = SimpleLogger::new().with_level(level).init();

    if let Err(err) = config.validate() {
        eprintln!("{err}");
        std::process::exit(1);
    }
    if let Err(err) = run(config) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

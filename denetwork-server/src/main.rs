use std::time::Duration;

use clap::{App, Arg};
use denetwork::{ErrorUtils, Server, ServerConfig};

fn main() {
    let matches = App::new("DENetwork Server")
        .version("1.0")
        .author("SleepingPills <tom.farnbauer@gmail.com>")
        .about("Runs a standalone DENetwork listener.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the server's TOML config file")
                .required(false),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info")
                .help("terminal log level: trace, debug, info, warning, error, critical"),
        )
        .get_matches();

    let logger = denetwork::logging::terminal_logger(matches.value_of("log-level").unwrap());

    let config = match matches.value_of("CONFIG_FILE") {
        Some(path) => ServerConfig::load(path).expect("error parsing config file"),
        None => ServerConfig::default(),
    };

    let mut server = Server::new(Some(&logger)).expect("failed to create udp endpoint");
    server.listen_on(config).expect("failed to bind listening socket");

    slog::info!(logger, "denetwork server running"; "address" => %server.local_address().unwrap());

    loop {
        if let Err(err) = server.poll(Some(Duration::from_millis(100))) {
            if err.has_failed() {
                slog::warn!(logger, "poll error"; "error" => %err);
            }
        }
    }
}

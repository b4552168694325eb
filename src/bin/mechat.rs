/*
 * mechat is the replica server. It takes its identity from the command line
 * (the zero-based offset into the replica address file), joins the cluster,
 * and serves the chat RPC surface on its address from the file.
 */

#![warn(clippy::all)]

use mechat::error::Result;
use mechat::replica::{AddressBook, Clock, Log, Pid, Replica, Server};
use mechat::store::Store;

use chrono::TimeDelta;
use std::net::TcpListener;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A replicated chat backend server")
        .arg(
            clap::Arg::new("offset")
                .required(true)
                .value_parser(clap::value_parser!(i64))
                .help("Zero-based index of this replica in the address file (its PID)"),
        )
        .arg(
            clap::Arg::new("clock_offset")
                .required(false)
                .value_parser(clap::value_parser!(i64))
                .help("Initial clock offset in seconds, to test skew"),
        )
        .arg(
            clap::Arg::new("addrs")
                .short('a')
                .long("addrs")
                .default_value("replica_addrs.txt")
                .help("Replica address file, one host:port per line"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("log-level")
                .default_value("info")
                .help("Log level (error, warn, info, debug, trace)"),
        )
        .get_matches();

    let loglevel = args
        .get_one::<String>("log_level")
        .expect("log_level has a default")
        .parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("mechat");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let pid = *args.get_one::<Pid>("offset").expect("offset is required");
    let clock_offset = args.get_one::<i64>("clock_offset").copied().unwrap_or(0);
    let addrs =
        AddressBook::load(args.get_one::<String>("addrs").expect("addrs has a default"))?;

    let store = Store::open(format!("mechat{pid}.sqlite"))?;
    let log = Log::new(format!("logs-node-{pid}"))?;
    let clock = Clock::new(TimeDelta::seconds(clock_offset));
    let replica = Arc::new(Replica::new(pid, addrs, store, log, clock)?);

    let listener = TcpListener::bind(replica.addr()?.socket_addr()?)?;
    Server::new(replica).serve(listener)
}

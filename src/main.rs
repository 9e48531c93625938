use log::error;

use pg_relay::app::{init_logging, parse, run_server};
use pg_relay::config::{get_config, init_config};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = parse();

    let init_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("could not build the init runtime");
    if let Err(err) = init_runtime.block_on(init_config(&args.config_file)) {
        eprintln!("configuration error: {err}");
        std::process::exit(exitcode::CONFIG);
    }
    drop(init_runtime);

    let config = get_config();
    if let Err(err) = init_logging(&args, &config) {
        eprintln!("could not initialize logging: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }

    if args.test_config {
        println!("configuration file {} is valid", args.config_file);
        std::process::exit(exitcode::OK);
    }

    if let Err(err) = run_server((*config).clone()) {
        error!("server failed: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }
    std::process::exit(exitcode::OK);
}

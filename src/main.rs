use env_logger::Env;

fn main() {
    env_logger::builder()
        .parse_env(Env::new().filter_or("EXTRACE_LOG", "warn"))
        .format_timestamp(None)
        .init();

    if let Err(err) = extrace::app::run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

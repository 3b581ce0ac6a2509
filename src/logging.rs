use colored::Colorize;

/// Initializes the global logger. `RUST_LOG` wins; the daemon default keeps
/// its own crates at info and silences chatty HTTP internals.
pub fn init() {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var("RUST_LOG").is_err() {
        builder
            .filter_level(log::LevelFilter::Info)
            .filter_module("rocket", log::LevelFilter::Warn)
            .filter_module("hyper", log::LevelFilter::Warn);
    }
    builder.init();
}

pub fn print_banner(title: &str, color: fn(&str) -> colored::ColoredString) {
    let border = "╔═══════════════════════════════════════════════════════════════╗";
    let bottom = "╚═══════════════════════════════════════════════════════════════╝";

    println!("{}", color(border));
    println!("{}", color(&format!("║{:^63}║", title)));
    println!("{}", color(bottom));
}

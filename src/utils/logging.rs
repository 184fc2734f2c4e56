use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// `-v` count to log level: warnings by default, then info, debug and trace
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

pub fn setup_logging(level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_thread_ids(level >= Level::DEBUG)
        .with_file(level >= Level::DEBUG)
        .with_line_number(level >= Level::DEBUG)
        .with_target(true)
        .with_level(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

use env_logger::Builder;
use std::io::Write;

/// Install a logger driven by `RUST_LOG`. Calling it more than once is harmless, so tests can
/// call it in every case.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    let _ = builder
        .format_timestamp_millis()
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{lvl}{:5}{lvl:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Always)
        .is_test(cfg!(test))
        .try_init();
}

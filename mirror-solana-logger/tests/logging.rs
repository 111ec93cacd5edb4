use mirror_solana_logger::{init, LogConfig, LogFormat, LogOutput};
use tracing::Level;

fn parse(toml: &str) -> anyhow::Result<LogConfig> {
    let config = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?
        .try_deserialize::<LogConfig>()?;
    Ok(config)
}

#[test]
fn log_config_defaults_fill_missing_fields() -> anyhow::Result<()> {
    let config = parse(r#"level = "debug""#)?;
    assert_eq!(config.level(), Level::DEBUG);
    assert_eq!(config.format, LogFormat::Plain);
    assert_eq!(config.output, LogOutput::Stdout);
    assert!(config.file_path.is_none());
    Ok(())
}

#[test]
fn unknown_level_falls_back_to_info() -> anyhow::Result<()> {
    let config = parse(
        r#"
        level = "chatty"
        format = "json"
        output = "file"
        file-path = "/tmp/mirror.log"
        "#,
    )?;
    assert_eq!(config.level(), Level::INFO);
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.output, LogOutput::File);
    assert_eq!(config.file_path.as_deref(), Some("/tmp/mirror.log"));
    Ok(())
}

#[test]
fn file_output_requires_a_path_and_writes_json_lines() -> anyhow::Result<()> {
    let missing = LogConfig {
        output: LogOutput::File,
        ..LogConfig::default()
    };
    let err = init(&missing).expect_err("file output without a path must fail");
    assert!(err.to_string().contains("file_path"));

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("connector.log");
    let config = LogConfig {
        level: "info".to_string(),
        format: LogFormat::Json,
        output: LogOutput::File,
        file_path: Some(path.to_string_lossy().into_owned()),
    };
    init(&config)?;

    tracing::info!(slot = 42u64, "account updated");
    tracing::debug!("filtered out below info");

    let written = std::fs::read_to_string(&path)?;
    assert!(written.contains("account updated"));
    assert!(written.contains("\"slot\":42"));
    assert!(!written.contains("filtered out below info"));

    // A second global subscriber cannot be installed.
    assert!(init(&LogConfig::default()).is_err());
    Ok(())
}

//! Unit tests for `AppError` display and conversions.

use agent_conductor::AppError;

#[test]
fn display_prefixes_each_variant() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Agent("boom".into()), "agent: boom"),
        (AppError::Policy("denied".into()), "policy: denied"),
        (AppError::Ipc("closed".into()), "ipc: closed"),
        (AppError::NotFound("run x".into()), "not found: run x"),
        (AppError::Io("eof".into()), "io: eof"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(ref msg) if msg == "gone"));
}

#[test]
fn toml_error_converts_to_config() {
    let parse = toml::from_str::<toml::Value>("= nope").unwrap_err();
    let err: AppError = parse.into();
    assert!(matches!(err, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

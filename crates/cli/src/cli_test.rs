use super::*;
use clap::CommandFactory;

#[test]
fn verify_cli_args() {
    Cli::command().debug_assert();
}

#[test]
fn parses_history_filters() {
    let cli = Cli::try_parse_from(["docmig", "history", "--unit", "users", "--json"]).unwrap();
    match cli.command {
        Commands::History(args) => {
            assert_eq!(args.unit.as_deref(), Some("users"));
            assert!(args.json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_flags_override_collections() {
    let cli = Cli::try_parse_from([
        "docmig",
        "status",
        "--database",
        "appdb",
        "--history-collection",
        "applied",
        "--lock-collection",
        "mutex",
    ])
    .unwrap();

    assert!(matches!(cli.command, Commands::Status));
    let config = cli.global.config();
    assert_eq!(config.database.as_deref(), Some("appdb"));
    assert_eq!(config.history_collection, "applied");
    assert_eq!(config.lock_collection, "mutex");
}

#[test]
fn subcommand_is_required() {
    assert!(Cli::try_parse_from(["docmig"]).is_err());
    assert!(Cli::try_parse_from(["docmig", "unlock", "--unknown"]).is_err());
}

mod cli;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Commands};
use versionfs::config::Config;
use versionfs::error::VersionError;
use versionfs::service::VersioningService;
use versionfs::store::{FolderId, FolderRecord, Sort};
use versionfs::tale::Tale;
use versionfs::reaper;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let json_output = cli.json;

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    let service = VersioningService::open(config)?;

    match cli.command {
        Commands::CreateTale { title, workspace, creator } => {
            let tale = service.create_tale(&title, &creator, &workspace)?;
            print_tale(&tale, json_output);
        }
        Commands::ListTales => {
            let tales = service.tales().list()?;
            if json_output {
                println!("{}", serde_json::to_string_pretty(&tales)?);
            } else {
                for tale in tales {
                    println!("{}  {}", tale.id, tale.title);
                }
            }
        }
        Commands::RemoveTale { tale } => {
            service.remove_tale(&parse_id(&tale)?)?;
            report_ok("tale removed", json_output);
        }
        Commands::CreateVersion { tale, name, force, allow_rename } => {
            match service.versions().create(&parse_id(&tale)?, name.as_deref(), force, allow_rename)
            {
                Ok(version) => print_record(&version, json_output),
                Err(VersionError::NotModified { version_id }) => {
                    if json_output {
                        println!(
                            "{}",
                            serde_json::json!({"message": "Not modified", "extra": version_id})
                        );
                    } else {
                        println!("Not modified (version {})", version_id);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::ListVersions { tale, limit, offset } => {
            let versions =
                service.versions().list(&parse_id(&tale)?, Sort::created(), limit, offset)?;
            print_records(&versions, json_output);
        }
        Commands::RenameVersion { version, name, allow_rename } => {
            let renamed = service.versions().rename(&parse_id(&version)?, &name, allow_rename)?;
            print_record(&renamed, json_output);
        }
        Commands::DeleteVersion { version } => {
            service.versions().delete(&parse_id(&version)?)?;
            report_ok("version deleted", json_output);
        }
        Commands::VersionDataset { version } => {
            let data_set = service.versions().data_set(&parse_id(&version)?)?;
            println!("{}", serde_json::to_string_pretty(&data_set)?);
        }
        Commands::Restore { tale, version } => {
            let tale = service.versions().restore(&parse_id(&tale)?, &parse_id(&version)?)?;
            print_tale(&tale, json_output);
        }
        Commands::CreateRun { version, name, allow_rename } => {
            let run = service.runs().create(&parse_id(&version)?, name.as_deref(), allow_rename)?;
            print_record(&run, json_output);
        }
        Commands::ListRuns { tale } => {
            let runs = service.runs().list(&parse_id(&tale)?, Sort::created(), 0, 0)?;
            print_records(&runs, json_output);
        }
        Commands::RunStatus { run } => {
            let (status, status_string) = service.runs().get_status(&parse_id(&run)?)?;
            if json_output {
                println!(
                    "{}",
                    serde_json::json!({"status": status, "statusString": status_string})
                );
            } else {
                println!("{} {}", status, status_string);
            }
        }
        Commands::SetRunStatus { run, status } => {
            service.runs().set_status_code(&parse_id(&run)?, status)?;
            report_ok("status updated", json_output);
        }
        Commands::StartRun { run, entrypoint } => {
            let handle = service.runs().start(&parse_id(&run)?, entrypoint.as_deref())?;
            if json_output {
                println!(
                    "{}",
                    serde_json::json!({"jobId": handle.job_id, "queue": handle.queue, "taskId": handle.task_id})
                );
            } else {
                println!("job {} on {}", handle.job_id, handle.queue);
            }
        }
        Commands::DeleteRun { run } => {
            service.runs().delete(&parse_id(&run)?)?;
            report_ok("run deleted", json_output);
        }
        Commands::Fork { source, destination, version, shallow } => {
            let target = version.as_deref().map(parse_id).transpose()?;
            let outcome = service.on_tale_copied(
                &parse_id(&source)?,
                &parse_id(&destination)?,
                target.as_ref(),
                shallow,
            )?;
            if json_output {
                println!(
                    "{}",
                    serde_json::json!({
                        "versionsCopied": outcome.versions_copied,
                        "runsCopied": outcome.runs_copied,
                        "versionIdMap": outcome.version_id_map,
                    })
                );
            } else {
                println!(
                    "copied {} version(s), {} run(s)",
                    outcome.versions_copied, outcome.runs_copied
                );
            }
        }
        Commands::Reap => {
            let stats = reaper::sweep(service.runs(), service.queue().as_ref())?;
            if json_output {
                println!(
                    "{}",
                    serde_json::json!({
                        "examined": stats.examined,
                        "demoted": stats.demoted,
                        "cleaned": stats.cleaned,
                    })
                );
            } else {
                println!(
                    "examined {}, demoted {}, cleaned {}",
                    stats.examined, stats.demoted, stats.cleaned
                );
            }
        }
        Commands::Audit { limit } => {
            for event in service.audit().recent(limit) {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}

fn parse_id(s: &str) -> Result<FolderId> {
    FolderId::parse(s).with_context(|| format!("invalid id: {}", s))
}

fn print_record(record: &FolderRecord, json_output: bool) {
    if json_output {
        println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
    } else {
        println!("{}  {}", record.id, record.name);
    }
}

fn print_records(records: &[FolderRecord], json_output: bool) {
    if json_output {
        println!("{}", serde_json::to_string_pretty(records).unwrap_or_default());
    } else {
        for record in records {
            println!("{}  {}", record.id, record.name);
        }
    }
}

fn print_tale(tale: &Tale, json_output: bool) {
    if json_output {
        println!("{}", serde_json::to_string_pretty(tale).unwrap_or_default());
    } else {
        println!("{}  {}", tale.id, tale.title);
    }
}

fn report_ok(message: &str, json_output: bool) {
    if json_output {
        println!("{}", serde_json::json!({"ok": true, "message": message}));
    } else {
        println!("{}", message);
    }
}

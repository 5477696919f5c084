use anyhow::{Context, Result};
use clap::Parser;
use filesmith_core::{
    operations, CancellationToken, EditPair, Engine, EngineConfig, EngineError, GrepOptions,
    ListFilter, PatternSpec, PipelineRequest,
};
use nu_ansi_term::Color;
use std::io::{IsTerminal, Read};

mod cli;

use cli::{AnalyzeCommands, BackupCommands, Cli, Commands};

fn main() {
    // Graceful shutdown on SIGINT and SIGTERM: flip the cancellation
    // token and let in-flight operations clean up their temp files.
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived SIGINT, cancelling...");
        cancel_clone.cancel();
    })
    .expect("Error setting SIGINT handler");

    #[cfg(unix)]
    {
        let cancel_clone = cancel.clone();
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGTERM, move || {
                cancel_clone.cancel();
            })
            .expect("Error setting SIGTERM handler");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("FILESMITH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let use_color = !cli.no_color && std::io::stdout().is_terminal();

    match run(cli, &cancel) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
        },
        Err(e) => {
            report_error(&e, use_color);
            std::process::exit(exit_code(&e));
        },
    }
}

/// Bound a rendered response to the configured ceiling, noting the cut.
fn truncate_response(output: String, max_response_size: usize) -> String {
    if output.len() <= max_response_size {
        return output;
    }
    let mut cut = max_response_size;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n... (response truncated at {} bytes)",
        &output[..cut],
        max_response_size
    )
}

fn report_error(error: &anyhow::Error, use_color: bool) {
    let message = format!("{error:#}");
    if use_color && matches!(error.downcast_ref(), Some(EngineError::Blocked { .. })) {
        eprintln!("{}", Color::Red.bold().paint(message));
    } else {
        eprintln!("Error: {message}");
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::Blocked { .. }) => 3,
        Some(EngineError::Cancelled) => 130,
        Some(_) => 1,
        None => 2,
    }
}

fn run(cli: Cli, cancel: &CancellationToken) -> Result<String> {
    let mut config = match cli.config {
        Some(ref path) => EngineConfig::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => EngineConfig::load().unwrap_or_default(),
    };
    if !cli.allowed.is_empty() {
        config.allowed_paths = cli.allowed.clone();
    }

    let engine = Engine::new(config)?;
    let json = cli.json;
    let max_response_size = engine.config.limits.max_response_size;

    let output = match cli.command {
        Commands::Search {
            path,
            pattern,
            content,
            file_types,
        } => {
            let outcome = operations::search_operation(
                &engine,
                &path,
                &pattern,
                content,
                &file_types,
                cancel,
            )?;
            Ok(if json {
                filesmith_core::output::to_json(&outcome)
            } else {
                filesmith_core::output::format_search(
                    &outcome,
                    engine.config.limits.compact_mode,
                )
            })
        },

        Commands::Grep {
            path,
            pattern,
            ignore_case,
            whole_word,
            context,
        } => {
            let options = GrepOptions {
                case_sensitive: !ignore_case,
                whole_word,
                include_context: context.is_some(),
                context_lines: context.unwrap_or(0),
            };
            let matches =
                operations::grep_operation(&engine, &path, &pattern, &options, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&matches)
            } else {
                filesmith_core::output::format_grep(&matches)
            })
        },

        Commands::Count {
            path,
            pattern,
            lines,
        } => {
            let outcome =
                operations::count_operation(&engine, &path, &pattern, lines, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&outcome)
            } else {
                filesmith_core::output::format_count(&outcome)
            })
        },

        Commands::Edit {
            path,
            old_text,
            new_text,
            force,
        } => {
            let result =
                operations::edit_operation(&engine, &path, &old_text, &new_text, force, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&result)
            } else {
                filesmith_core::output::format_edit(&result)
            })
        },

        Commands::MultiEdit { path, edits } => {
            let raw = read_arg_or_stdin(&edits)?;
            let pairs: Vec<EditPair> =
                serde_json::from_str(&raw).context("edits must be a JSON array of {old_text, new_text}")?;
            let result = operations::multi_edit_operation(&engine, &path, &pairs, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&result)
            } else {
                filesmith_core::output::format_multi_edit(&result)
            })
        },

        Commands::ReplaceNth {
            path,
            pattern,
            replacement,
            occurrence,
        } => {
            let result = operations::replace_nth_operation(
                &engine,
                &path,
                &pattern,
                &replacement,
                occurrence,
                cancel,
            )?;
            Ok(if json {
                filesmith_core::output::to_json(&result)
            } else {
                filesmith_core::output::format_replace_nth(&result)
            })
        },

        Commands::Transform {
            path,
            patterns,
            mode,
            dry_run,
        } => {
            let raw = read_arg_or_stdin(&patterns)?;
            let specs: Vec<PatternSpec> =
                serde_json::from_str(&raw).context("patterns must be a JSON array of pattern specs")?;
            let result = operations::transform_operation(
                &engine,
                &path,
                &specs,
                mode.into(),
                dry_run,
                cancel,
            )?;
            Ok(if json {
                filesmith_core::output::to_json(&result)
            } else {
                filesmith_core::output::format_transform(&result)
            })
        },

        Commands::Pipeline {
            plan,
            dry_run,
            force,
        } => {
            let raw = if plan == "-" {
                read_stdin()?
            } else {
                std::fs::read_to_string(&plan)
                    .with_context(|| format!("failed to read plan file {plan}"))?
            };
            let mut request: PipelineRequest =
                serde_json::from_str(&raw).context("plan is not valid pipeline JSON")?;
            request.dry_run = request.dry_run || dry_run;
            request.force = request.force || force;

            let result = operations::pipeline_operation(&engine, &request, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&result)
            } else {
                filesmith_core::output::format_pipeline(&result)
            })
        },

        Commands::Backup(command) => run_backup(&engine, command, json, cancel),
        Commands::Analyze(command) => run_analyze(&engine, command, json, cancel),
    };

    Ok(truncate_response(output?, max_response_size))
}

fn run_backup(
    engine: &Engine,
    command: BackupCommands,
    json: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    match command {
        BackupCommands::Create { paths, context } => {
            anyhow::ensure!(!paths.is_empty(), "backup create needs at least one path");
            let id = operations::create_backup_operation(engine, &paths, &context, cancel)?;
            Ok(if json {
                serde_json::json!({ "backup_id": id }).to_string()
            } else {
                format!("Created backup {id}")
            })
        },

        BackupCommands::List {
            limit,
            operation,
            path_contains,
            hours,
        } => {
            let filter = ListFilter {
                limit,
                operation,
                path_substring: path_contains,
                newer_than_hours: hours,
            };
            let records = operations::list_backups_operation(engine, &filter, cancel)?;
            if json {
                return Ok(filesmith_core::output::to_json(&records));
            }
            if records.is_empty() {
                return Ok("No backups found".to_string());
            }

            use comfy_table::{Cell, Color, Table};
            let mut table = Table::new();
            table.set_header(vec![
                Cell::new("ID").fg(Color::Cyan),
                Cell::new("Created").fg(Color::Cyan),
                Cell::new("Operation").fg(Color::Cyan),
                Cell::new("Files").fg(Color::Cyan),
                Cell::new("Bytes").fg(Color::Cyan),
                Cell::new("Context").fg(Color::Cyan),
            ]);
            for record in &records {
                let date = record
                    .timestamp
                    .split('.')
                    .next()
                    .unwrap_or(&record.timestamp);
                table.add_row(vec![
                    record.backup_id.clone(),
                    date.to_string(),
                    record.operation.clone(),
                    record.files.len().to_string(),
                    record.total_size.to_string(),
                    record.user_context.clone(),
                ]);
            }
            Ok(table.to_string())
        },

        BackupCommands::Restore {
            backup_id,
            file,
            pre_backup,
        } => {
            let outcome = operations::restore_backup_operation(
                engine,
                &backup_id,
                file.as_deref(),
                pre_backup,
                cancel,
            )?;
            Ok(if json {
                filesmith_core::output::to_json(&outcome)
            } else {
                filesmith_core::output::format_restore(&outcome)
            })
        },

        BackupCommands::Compare { backup_id, path } => {
            let report =
                operations::compare_backup_operation(engine, &backup_id, &path, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&report)
            } else {
                filesmith_core::output::format_compare(&report)
            })
        },

        BackupCommands::Cleanup { days, dry_run } => {
            let outcome =
                operations::cleanup_backups_operation(engine, days, dry_run, cancel)?;
            Ok(if json {
                filesmith_core::output::to_json(&outcome)
            } else {
                filesmith_core::output::format_cleanup(&outcome)
            })
        },
    }
}

fn run_analyze(
    engine: &Engine,
    command: AnalyzeCommands,
    json: bool,
    cancel: &CancellationToken,
) -> Result<String> {
    let outcome = match command {
        AnalyzeCommands::Edit {
            path,
            old_text,
            new_text,
        } => operations::analyze_edit_operation(engine, &path, &old_text, &new_text, cancel)?,
        AnalyzeCommands::Write { path, content } => {
            let new_content = read_arg_or_stdin_file(&content)?;
            operations::analyze_write_operation(engine, &path, &new_content, cancel)?
        },
        AnalyzeCommands::Delete { path } => {
            operations::analyze_delete_operation(engine, &path, cancel)?
        },
    };

    Ok(if json {
        filesmith_core::output::to_json(&outcome)
    } else {
        filesmith_core::output::format_analyze(&outcome)
    })
}

/// Inline value, or stdin when the argument is '-'.
fn read_arg_or_stdin(arg: &str) -> Result<String> {
    if arg == "-" {
        read_stdin()
    } else {
        Ok(arg.to_string())
    }
}

/// File path, or stdin when the argument is '-'.
fn read_arg_or_stdin_file(arg: &str) -> Result<String> {
    if arg == "-" {
        read_stdin()
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("failed to read {arg}"))
    }
}

fn read_stdin() -> Result<String> {
    let mut buffer = String::new();
    std::io::stdin()
        .read_to_string(&mut buffer)
        .context("failed to read stdin")?;
    Ok(buffer)
}

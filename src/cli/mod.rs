mod batch;

use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use console::style;
use tracing::debug;

use crate::core::config::AppConfig;
use crate::core::terminal::{self, GuideSection};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Jobs")
        .command("run", "Process every row of a file with one prompt")
        .command("resume --job <id>", "Continue a paused or stopped job")
        .command("restart --job <id>", "Process a saved job again from row 0")
        .command("jobs", "List saved jobs")
        .command("export --job <id> --out <f>", "Write a job's rows as JSON Lines")
        .print();

    GuideSection::new("Setup")
        .command("models", "List available model targets")
        .command("notify-test", "Send a test card to the configured webhook")
        .print();

    GuideSection::new("run options")
        .text("--rows <file.json>        JSON array of row objects")
        .text("--model, -m <id>          Model target id or name")
        .text("--prompt, -p <text|@file> Prompt sent with every row")
        .text("--input-column, -c <col>  Column whose text is sent")
        .text("--output-column <col>     Primary output column name")
        .text("--concurrency, -j <n>     Rows in flight at once")
        .text("--title <text>            Job title")
        .text("--notify                  Send a notification on completion")
        .blank()
        .text("While running: p pauses, s stops, a number sets concurrency.")
        .blank()
        .hint("promptbatch run --rows calls.json -m qwen-plus -p @prompt.txt -c text")
        .print();

    println!(
        "\n {} {} [--config <file>] [--quiet] <command>\n",
        style("Usage:").bold(),
        style("promptbatch").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GlobalFlags {
    pub config: Option<PathBuf>,
    pub quiet: bool,
}

/// Pull global flags out of `args`, returning them and the remaining words.
pub(crate) fn parse_global_flags(args: &[String]) -> (GlobalFlags, Vec<String>) {
    let mut flags = GlobalFlags::default();
    let mut rest = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--quiet" | "-q" => {
                flags.quiet = true;
                i += 1;
            }
            _ => {
                rest.push(args[i].clone());
                i += 1;
            }
        }
    }
    (flags, rest)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RunCommandArgs {
    pub rows: Option<PathBuf>,
    pub model: String,
    pub prompt: String,
    pub input_column: String,
    pub output_column: Option<String>,
    pub concurrency: Option<usize>,
    pub title: Option<String>,
    pub notify: bool,
}

pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> Result<RunCommandArgs> {
    let mut parsed = RunCommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--rows" | "-r" => {
                parsed.rows = value.map(PathBuf::from);
                i += 2;
            }
            "--model" | "-m" => {
                parsed.model = value.unwrap_or_default();
                i += 2;
            }
            "--prompt" | "-p" => {
                parsed.prompt = value.unwrap_or_default();
                i += 2;
            }
            "--input-column" | "-c" => {
                parsed.input_column = value.unwrap_or_default();
                i += 2;
            }
            "--output-column" => {
                parsed.output_column = value;
                i += 2;
            }
            "--concurrency" | "-j" => {
                let raw = value.unwrap_or_default();
                let n = raw
                    .parse::<usize>()
                    .map_err(|_| anyhow!("--concurrency expects a whole number, got '{}'", raw))?;
                parsed.concurrency = Some(n);
                i += 2;
            }
            "--title" => {
                parsed.title = value;
                i += 2;
            }
            "--notify" => {
                parsed.notify = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    if parsed.rows.is_none() {
        bail!("--rows <file.json> is required for run");
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct JobCommandArgs {
    pub job: Option<String>,
    pub out: Option<PathBuf>,
    pub all_columns: bool,
}

pub(crate) fn parse_job_command_args(args: &[String], start: usize) -> JobCommandArgs {
    let mut parsed = JobCommandArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--job" | "-J" => {
                if i + 1 < args.len() {
                    parsed.job = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--out" | "-o" => {
                if i + 1 < args.len() {
                    parsed.out = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--all-columns" => {
                parsed.all_columns = true;
                i += 1;
            }
            other if parsed.job.is_none() && !other.starts_with('-') => {
                parsed.job = Some(other.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }
    parsed
}

pub async fn run_main() -> Result<()> {
    let raw: Vec<String> = std::env::args().collect();
    let (flags, args) = parse_global_flags(&raw);

    let cmd = args.get(1).map(String::as_str).unwrap_or("");
    if matches!(cmd, "" | "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let config = AppConfig::load(flags.config.as_deref()).await?;
    let log_tx = crate::logging::init(&config.log_level(), flags.quiet);
    let log_path = config.data_dir().join("logs").join("promptbatch.log");
    if let Err(e) = crate::logging::spawn_file_sink(log_tx.subscribe(), &log_path).await {
        debug!("Log file {} unavailable: {}", log_path.display(), e);
    }

    match cmd {
        "run" => {
            let parsed = parse_run_command_args(&args, 2)?;
            batch::run_new(&config, parsed).await
        }
        "resume" | "restart" => {
            let parsed = parse_job_command_args(&args, 2);
            let job_id = parsed
                .job
                .ok_or_else(|| anyhow!("--job <id> is required for {}", cmd))?;
            batch::run_saved(&config, &job_id, cmd == "restart").await
        }
        "jobs" => {
            batch::list_jobs(&config);
            Ok(())
        }
        "export" => {
            let parsed = parse_job_command_args(&args, 2);
            match (parsed.job, parsed.out) {
                (Some(job_id), Some(out)) => {
                    batch::export_job(&config, &job_id, &out, parsed.all_columns).await
                }
                _ => bail!("export needs --job <id> and --out <file>"),
            }
        }
        "models" => {
            batch::list_models(&config);
            Ok(())
        }
        "notify-test" => batch::notify_test(&config).await,
        _ => {
            print_help();
            bail!("Unknown command: {}", cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_global_flags, parse_job_command_args, parse_run_command_args};
    use std::path::PathBuf;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn global_flags_are_removed_wherever_they_appear() {
        let (flags, rest) = parse_global_flags(&words("promptbatch jobs --config cfg.toml -q"));
        assert_eq!(flags.config, Some(PathBuf::from("cfg.toml")));
        assert!(flags.quiet);
        assert_eq!(rest, words("promptbatch jobs"));
    }

    #[test]
    fn parse_run_command_args_reads_every_option() {
        let args = words(
            "promptbatch run --rows rows.json -m qwen-plus -p @prompt.txt -c 文本 \
             --output-column 标签 -j 8 --title calls --notify",
        );
        let parsed = parse_run_command_args(&args, 2).unwrap();
        assert_eq!(parsed.rows, Some(PathBuf::from("rows.json")));
        assert_eq!(parsed.model, "qwen-plus");
        assert_eq!(parsed.prompt, "@prompt.txt");
        assert_eq!(parsed.input_column, "文本");
        assert_eq!(parsed.output_column.as_deref(), Some("标签"));
        assert_eq!(parsed.concurrency, Some(8));
        assert_eq!(parsed.title.as_deref(), Some("calls"));
        assert!(parsed.notify);
    }

    #[test]
    fn bad_concurrency_is_rejected() {
        let err = parse_run_command_args(&words("promptbatch run --rows r.json -j many"), 2).unwrap_err();
        assert!(err.to_string().contains("'many'"));
    }

    #[test]
    fn run_without_rows_is_rejected() {
        let err = parse_run_command_args(&words("promptbatch run -m qwen-plus"), 2).unwrap_err();
        assert!(err.to_string().contains("--rows"));
    }

    #[test]
    fn job_id_may_be_positional() {
        let parsed = parse_job_command_args(&words("promptbatch resume 3f2a"), 2);
        assert_eq!(parsed.job.as_deref(), Some("3f2a"));

        let parsed =
            parse_job_command_args(&words("promptbatch export --job 3f2a --out rows.jsonl --all-columns"), 2);
        assert_eq!(parsed.job.as_deref(), Some("3f2a"));
        assert_eq!(parsed.out, Some(PathBuf::from("rows.jsonl")));
        assert!(parsed.all_columns);
    }
}

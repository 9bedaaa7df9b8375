use std::fmt;
use std::path::PathBuf;

use exam_core::model::{OptionId, QuestionId, TestId, UserId};

pub const DEFAULT_DB_URL: &str = "sqlite://exam.sqlite3";

#[derive(Debug, PartialEq, Eq)]
pub enum ArgsError {
    MissingValue { flag: &'static str },
    MissingFlag { flag: &'static str },
    UnknownArg(String),
    UnknownCommand(String),
    InvalidNumber { flag: &'static str, raw: String },
    InvalidUser { raw: String },
    InvalidAnswer { raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingFlag { flag } => write!(f, "{flag} is required"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::UnknownCommand(cmd) => write!(f, "unknown subcommand: {cmd}"),
            ArgsError::InvalidNumber { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidUser { raw } => write!(f, "invalid --user value: {raw}"),
            ArgsError::InvalidAnswer { raw } => {
                write!(f, "invalid --answer value: {raw} (expected <question>=<option>)")
            }
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

/// What `run` does once answers are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Leave the attempt in progress.
    Leave,
    Submit,
    Abandon,
    /// Keep the session open until the timer submits it.
    WaitForTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Migrate,
    Seed {
        test_id: TestId,
        questions: u64,
        minutes: u32,
    },
    Cleanup {
        /// Repeat every N seconds until Ctrl-C.
        watch_secs: Option<u64>,
    },
    Run {
        user_id: UserId,
        test_id: TestId,
        answers: Vec<(QuestionId, OptionId)>,
        finish: Finish,
        restart: bool,
        queue: Option<PathBuf>,
    },
    Recover {
        queue: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub db_url: String,
    pub command: Command,
}

pub fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  app migrate [--db <sqlite_url>]");
    eprintln!("  app seed    [--db <sqlite_url>] [--test <id>] [--questions <n>] [--minutes <n>]");
    eprintln!("  app cleanup [--db <sqlite_url>] [--watch <secs>]");
    eprintln!("  app run     [--db <sqlite_url>] --user <uuid> --test <id>");
    eprintln!("              [--answer <question>=<option>]... [--restart]");
    eprintln!("              [--submit | --abandon | --wait] [--queue <file>]");
    eprintln!("  app recover [--db <sqlite_url>] --queue <file>");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  EXAM_DB_URL (default {DEFAULT_DB_URL}), EXAM_LOG_JSON, RUST_LOG,");
    eprintln!("  EXAM_RESUME_PROMPT_MINUTES, EXAM_STALE_CLEANUP_HOURS, EXAM_RETRY_MAX_ATTEMPTS,");
    eprintln!("  EXAM_RETRY_BACKOFF_MS, EXAM_ANSWER_PERSISTENCE, EXAM_XP_POLICY");
}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<T, ArgsError> {
    let raw = require_value(args, flag)?;
    raw.trim()
        .parse()
        .map_err(|_| ArgsError::InvalidNumber { flag, raw })
}

fn parse_answer(raw: String) -> Result<(QuestionId, OptionId), ArgsError> {
    let parsed = raw.split_once('=').and_then(|(q, o)| {
        let q = q.trim().parse::<u64>().ok()?;
        let o = o.trim().parse::<u64>().ok()?;
        Some((QuestionId::new(q), OptionId::new(o)))
    });
    parsed.ok_or(ArgsError::InvalidAnswer { raw })
}

impl Args {
    /// Parse `argv` (without the program name). `env_db_url` is `EXAM_DB_URL`.
    pub fn parse(
        argv: impl IntoIterator<Item = String>,
        env_db_url: Option<String>,
    ) -> Result<Self, ArgsError> {
        let mut args = argv.into_iter();
        let name = args.next().ok_or(ArgsError::MissingFlag { flag: "<command>" })?;

        let mut db_url = env_db_url
            .filter(|value| !value.trim().is_empty())
            .map_or_else(|| DEFAULT_DB_URL.to_string(), normalize_sqlite_url);
        let mut test_id = None;
        let mut user_id = None;
        let mut questions = 10;
        let mut minutes = 30;
        let mut watch_secs = None;
        let mut answers = Vec::new();
        let mut finish = Finish::Leave;
        let mut restart = false;
        let mut queue = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--test" => test_id = Some(TestId::new(parse_number(&mut args, "--test")?)),
                "--user" => {
                    let raw = require_value(&mut args, "--user")?;
                    let parsed = raw
                        .parse::<UserId>()
                        .map_err(|_| ArgsError::InvalidUser { raw: raw.clone() })?;
                    user_id = Some(parsed);
                }
                "--questions" => questions = parse_number(&mut args, "--questions")?,
                "--minutes" => minutes = parse_number(&mut args, "--minutes")?,
                "--watch" => watch_secs = Some(parse_number(&mut args, "--watch")?),
                "--answer" => answers.push(parse_answer(require_value(&mut args, "--answer")?)?),
                "--submit" => finish = Finish::Submit,
                "--abandon" => finish = Finish::Abandon,
                "--wait" => finish = Finish::WaitForTimeout,
                "--restart" => restart = true,
                "--queue" => queue = Some(PathBuf::from(require_value(&mut args, "--queue")?)),
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let command = match name.as_str() {
            "migrate" => Command::Migrate,
            "seed" => Command::Seed {
                test_id: test_id.unwrap_or_else(|| TestId::new(1)),
                questions,
                minutes,
            },
            "cleanup" => Command::Cleanup { watch_secs },
            "run" => Command::Run {
                user_id: user_id.ok_or(ArgsError::MissingFlag { flag: "--user" })?,
                test_id: test_id.ok_or(ArgsError::MissingFlag { flag: "--test" })?,
                answers,
                finish,
                restart,
                queue,
            },
            "recover" => Command::Recover {
                queue: queue.ok_or(ArgsError::MissingFlag { flag: "--queue" })?,
            },
            other => return Err(ArgsError::UnknownCommand(other.to_string())),
        };

        Ok(Self { db_url, command })
    }
}

pub fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim();
    let path = std::path::Path::new(trimmed.strip_prefix("sqlite:").unwrap_or(trimmed));
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn run_collects_answers_and_finish() {
        let user = "6f1c2b6e-7d0e-4a53-9c1e-1f2d3c4b5a69";
        let args = Args::parse(
            argv(&[
                "run", "--user", user, "--test", "3", "--answer", "1=11", "--answer", "2 = 21",
                "--submit",
            ]),
            None,
        )
        .unwrap();

        assert_eq!(args.db_url, DEFAULT_DB_URL);
        let Command::Run {
            user_id,
            test_id,
            answers,
            finish,
            restart,
            queue,
        } = args.command
        else {
            panic!("expected run");
        };
        assert_eq!(user_id.to_string(), user);
        assert_eq!(test_id, TestId::new(3));
        assert_eq!(
            answers,
            vec![
                (QuestionId::new(1), OptionId::new(11)),
                (QuestionId::new(2), OptionId::new(21))
            ]
        );
        assert_eq!(finish, Finish::Submit);
        assert!(!restart);
        assert_eq!(queue, None);
    }

    #[test]
    fn run_requires_user_and_test() {
        let err = Args::parse(argv(&["run", "--test", "1"]), None).unwrap_err();
        assert_eq!(err, ArgsError::MissingFlag { flag: "--user" });
    }

    #[test]
    fn malformed_answers_are_rejected() {
        let err = Args::parse(argv(&["run", "--answer", "1:11"]), None).unwrap_err();
        assert!(matches!(err, ArgsError::InvalidAnswer { .. }));
    }

    #[test]
    fn db_url_comes_from_env_then_flag() {
        let args = Args::parse(argv(&["migrate"]), Some("sqlite:///tmp/a.db".into())).unwrap();
        assert_eq!(args.db_url, "sqlite:///tmp/a.db");

        let args = Args::parse(
            argv(&["migrate", "--db", "/tmp/b.db"]),
            Some("sqlite:///tmp/a.db".into()),
        )
        .unwrap();
        assert_eq!(args.db_url, "sqlite:///tmp/b.db");
    }

    #[test]
    fn seed_has_defaults() {
        let args = Args::parse(argv(&["seed", "--questions", "5"]), None).unwrap();
        assert_eq!(
            args.command,
            Command::Seed {
                test_id: TestId::new(1),
                questions: 5,
                minutes: 30
            }
        );
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = Args::parse(argv(&["launch"]), None).unwrap_err();
        assert_eq!(err, ArgsError::UnknownCommand("launch".into()));
    }
}

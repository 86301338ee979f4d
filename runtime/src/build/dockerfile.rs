//! Dockerfile parser.
//!
//! Parses a Dockerfile into global build arguments and an ordered list of
//! stages, one per `FROM`. Supports line continuations (`\`), comments, and
//! both shell and JSON (exec) forms for RUN/CMD/ENTRYPOINT.
//!
//! The parser is purely syntactic: variable references are kept verbatim
//! and resolved later by [`super::expand`], and stage references are
//! resolved by the planner.

use std::collections::HashSet;
use std::fmt;

use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};

/// A RUN/CMD/ENTRYPOINT command in shell or exec form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandForm {
    /// `RUN make install`, executed through `/bin/sh -c`
    Shell(String),
    /// `RUN ["make", "install"]`, executed directly
    Exec(Vec<String>),
}

impl CommandForm {
    /// The argument vector a process is started with.
    pub fn argv(&self) -> Vec<String> {
        match self {
            CommandForm::Shell(command) => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.clone(),
            ],
            CommandForm::Exec(argv) => argv.clone(),
        }
    }
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        alias: Option<String>,
    },
    /// `RUN <command>` or `RUN ["exec", "form"]`
    Run { command: CommandForm },
    /// `COPY [--from=<stage>] [--chown=..] [--chmod=..] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        from: Option<String>,
        chown: Option<String>,
        chmod: Option<u32>,
    },
    /// `ADD [--chown=..] [--chmod=..] <src|url>... <dst>`
    Add {
        src: Vec<String>,
        dst: String,
        chown: Option<String>,
        chmod: Option<u32>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { pairs: Vec<(String, String)> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<String> },
    /// `LABEL <key>=<value> ...`
    Label { pairs: Vec<(String, String)> },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
}

impl Instruction {
    /// Upper-case keyword of this instruction.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Label { .. } => "LABEL",
            Instruction::User { .. } => "USER",
            Instruction::Arg { .. } => "ARG",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From { image, alias } => match alias {
                Some(alias) => write!(f, "FROM {} AS {}", image, alias),
                None => write!(f, "FROM {}", image),
            },
            Instruction::Run { command } => match command {
                CommandForm::Shell(cmd) => write!(f, "RUN {}", cmd),
                CommandForm::Exec(argv) => write!(f, "RUN {:?}", argv),
            },
            Instruction::Copy { src, dst, from, .. } => match from {
                Some(stage) => write!(f, "COPY --from={} {} {}", stage, src.join(" "), dst),
                None => write!(f, "COPY {} {}", src.join(" "), dst),
            },
            Instruction::Add { src, dst, .. } => write!(f, "ADD {} {}", src.join(" "), dst),
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Env { pairs } => write!(f, "ENV {}", join_pairs(pairs)),
            Instruction::Entrypoint { exec } => write!(f, "ENTRYPOINT {:?}", exec),
            Instruction::Cmd { exec } => write!(f, "CMD {:?}", exec),
            Instruction::Expose { ports } => write!(f, "EXPOSE {}", ports.join(" ")),
            Instruction::Label { pairs } => write!(f, "LABEL {}", join_pairs(pairs)),
            Instruction::User { user } => write!(f, "USER {}", user),
            Instruction::Arg { name, default } => match default {
                Some(value) => write!(f, "ARG {}={}", name, value),
                None => write!(f, "ARG {}", name),
            },
        }
    }
}

fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// An instruction with the source line it was declared on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based line of the first physical line of the instruction
    pub line: usize,
    pub instruction: Instruction,
}

/// An `ARG` declared before the first `FROM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalArg {
    pub line: usize,
    pub name: String,
    pub default: Option<String>,
}

/// A build stage: a `FROM` and the instructions that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Position of the stage in the file
    pub index: usize,
    /// Lower-cased `AS` alias
    pub alias: Option<String>,
    /// Raw base reference, variables unexpanded
    pub base: String,
    /// Line of the `FROM`
    pub line: usize,
    /// All steps, the `FROM` first
    pub steps: Vec<Step>,
}

impl Stage {
    /// Display name: the alias, or the index for anonymous stages.
    pub fn name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.index.to_string())
    }
}

/// Parsed Dockerfile.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub global_args: Vec<GlobalArg>,
    pub stages: Vec<Stage>,
}

impl Dockerfile {
    /// Parse a Dockerfile from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut global_args = Vec::new();
        let mut stages: Vec<Stage> = Vec::new();
        let mut aliases = HashSet::new();

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let instruction = parse_instruction(trimmed, line_num)?;

            match (&instruction, stages.last_mut()) {
                (Instruction::From { image, alias }, _) => {
                    if let Some(alias) = alias {
                        if !aliases.insert(alias.clone()) {
                            return Err(syntax(
                                line_num,
                                format!("Duplicate stage name '{}'", alias),
                            ));
                        }
                    }
                    stages.push(Stage {
                        index: stages.len(),
                        alias: alias.clone(),
                        base: image.clone(),
                        line: line_num,
                        steps: vec![Step {
                            line: line_num,
                            instruction: instruction.clone(),
                        }],
                    });
                }
                (Instruction::Arg { name, default }, None) => {
                    global_args.push(GlobalArg {
                        line: line_num,
                        name: name.clone(),
                        default: default.clone(),
                    });
                }
                (_, None) => {
                    return Err(syntax(
                        line_num,
                        format!(
                            "{} before FROM: first instruction must be FROM (or ARG before FROM)",
                            instruction.keyword()
                        ),
                    ));
                }
                (_, Some(stage)) => stage.steps.push(Step {
                    line: line_num,
                    instruction,
                }),
            }
        }

        if stages.is_empty() {
            return Err(syntax(
                1,
                "Dockerfile contains no FROM instruction".to_string(),
            ));
        }

        Ok(Dockerfile {
            global_args,
            stages,
        })
    }

    /// Parse a Dockerfile from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Build(format!(
                "Failed to read Dockerfile at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

fn syntax(line: usize, message: String) -> KilnError {
    KilnError::Syntax { line, message }
}

/// Join lines ending with `\` into logical lines, keeping the line number
/// of each logical line's first physical line.
///
/// Comment lines inside a continuation are dropped.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        let line_num = idx + 1;
        if current.is_empty() {
            start = line_num;
        } else if line.trim_start().starts_with('#') {
            continue;
        }

        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    // Trailing continuation without a final line
    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "ADD" => parse_add(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "ENTRYPOINT" => parse_exec_form(rest, line_num, "ENTRYPOINT")
            .map(|exec| Instruction::Entrypoint { exec }),
        "CMD" => parse_exec_form(rest, line_num, "CMD").map(|exec| Instruction::Cmd { exec }),
        "EXPOSE" => parse_expose(rest, line_num),
        "LABEL" => parse_label(rest, line_num),
        "USER" => parse_user(rest, line_num),
        "ARG" => parse_arg(rest, line_num),
        "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" | "MAINTAINER" => Err(
            syntax(line_num, format!("Unsupported instruction '{}'", keyword_upper)),
        ),
        _ => Err(syntax(line_num, format!("Unknown instruction '{}'", keyword))),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let mut words: Vec<&str> = rest.split_whitespace().collect();

    // --platform is accepted for compatibility; images are resolved by reference only
    while let Some(flag) = words.first().filter(|w| w.starts_with("--")) {
        if !flag.starts_with("--platform=") {
            return Err(syntax(line_num, format!("Unknown FROM flag '{}'", flag)));
        }
        tracing::warn!(line = line_num, flag = *flag, "Ignoring FROM platform flag");
        words.remove(0);
    }

    match words.as_slice() {
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
        }),
        [image, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => {
            validate_alias(alias, line_num)?;
            Ok(Instruction::From {
                image: image.to_string(),
                alias: Some(alias.to_lowercase()),
            })
        }
        [] => Err(syntax(line_num, "FROM requires an image argument".to_string())),
        _ => Err(syntax(
            line_num,
            format!("FROM expects '<image> [AS <name>]', got '{}'", rest),
        )),
    }
}

fn validate_alias(alias: &str, line_num: usize) -> Result<()> {
    let valid = alias
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(syntax(line_num, format!("Invalid stage name '{}'", alias)));
    }
    Ok(())
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "RUN requires a command".to_string()));
    }
    if rest.starts_with("--") {
        let (flag, _) = split_first_word(rest);
        return Err(syntax(line_num, format!("Unsupported RUN flag '{}'", flag)));
    }

    let command = if rest.starts_with('[') {
        let argv = parse_json_array(rest, line_num)?;
        if argv.is_empty() {
            return Err(syntax(line_num, "RUN exec form must not be empty".to_string()));
        }
        CommandForm::Exec(argv)
    } else {
        CommandForm::Shell(rest.to_string())
    };

    Ok(Instruction::Run { command })
}

/// Flags and operands shared by COPY and ADD.
#[derive(Debug, Default)]
struct CopyArgs {
    src: Vec<String>,
    dst: String,
    from: Option<String>,
    chown: Option<String>,
    chmod: Option<u32>,
}

fn parse_copy_args(rest: &str, line_num: usize, keyword: &str) -> Result<CopyArgs> {
    let mut args = CopyArgs::default();
    let mut remaining = rest.trim();

    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        let (name, value) = flag.split_once('=').ok_or_else(|| {
            syntax(
                line_num,
                format!("{} flag '{}' requires a value", keyword, flag),
            )
        })?;
        match name {
            "--from" if keyword == "COPY" => args.from = Some(value.to_lowercase()),
            "--chown" => args.chown = Some(value.to_string()),
            "--chmod" => {
                let mode = u32::from_str_radix(value, 8).map_err(|_| {
                    syntax(line_num, format!("Invalid --chmod mode '{}'", value))
                })?;
                args.chmod = Some(mode);
            }
            _ => {
                return Err(syntax(
                    line_num,
                    format!("Unknown {} flag '{}'", keyword, name),
                ))
            }
        }
        remaining = after;
    }

    let parts = if remaining.starts_with('[') {
        parse_json_array(remaining, line_num)?
    } else {
        shell_words::split(remaining)
            .map_err(|e| syntax(line_num, format!("Invalid {} arguments: {}", keyword, e)))?
    };

    match parts.split_last() {
        Some((dst, src)) if !src.is_empty() => {
            args.dst = dst.clone();
            args.src = src.to_vec();
            Ok(args)
        }
        _ => Err(syntax(
            line_num,
            format!("{} requires at least one source and a destination", keyword),
        )),
    }
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let args = parse_copy_args(rest, line_num, "COPY")?;
    Ok(Instruction::Copy {
        src: args.src,
        dst: args.dst,
        from: args.from,
        chown: args.chown,
        chmod: args.chmod,
    })
}

fn parse_add(rest: &str, line_num: usize) -> Result<Instruction> {
    let args = parse_copy_args(rest, line_num, "ADD")?;
    Ok(Instruction::Add {
        src: args.src,
        dst: args.dst,
        chown: args.chown,
        chmod: args.chmod,
    })
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    let path = unquote(rest);
    if path.is_empty() {
        return Err(syntax(line_num, "WORKDIR requires a path".to_string()));
    }
    Ok(Instruction::Workdir { path })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    let pairs = parse_pairs(rest, line_num, "ENV")?;
    Ok(Instruction::Env { pairs })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    let pairs = parse_pairs(rest, line_num, "LABEL")?;
    Ok(Instruction::Label { pairs })
}

/// Parse `k=v k2="v 2"` pairs, or the legacy `key value` form.
fn parse_pairs(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<(String, String)>> {
    if rest.is_empty() {
        return Err(syntax(
            line_num,
            format!("{} requires a key and value", keyword),
        ));
    }

    let (first, remainder) = split_first_word(rest);
    if !first.contains('=') {
        // Legacy form: KEY VALUE (value is the rest of the line)
        if remainder.is_empty() {
            return Err(syntax(
                line_num,
                format!("{} {} requires a value", keyword, first),
            ));
        }
        return Ok(vec![(first.to_string(), unquote(remainder))]);
    }

    let words = shell_words::split(rest)
        .map_err(|e| syntax(line_num, format!("Invalid {} arguments: {}", keyword, e)))?;

    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(syntax(
                line_num,
                format!("{} expects key=value pairs, got '{}'", keyword, word),
            )),
        })
        .collect()
}

/// Parse a CMD/ENTRYPOINT argument: JSON exec form or shell form.
fn parse_exec_form(rest: &str, line_num: usize, keyword: &str) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(syntax(line_num, format!("{} requires an argument", keyword)));
    }

    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        Ok(CommandForm::Shell(rest.to_string()).argv())
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    let ports: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
    if ports.is_empty() {
        return Err(syntax(line_num, "EXPOSE requires a port".to_string()));
    }
    for port in ports.iter().filter(|p| !p.contains('$')) {
        normalize_port(port).map_err(|message| syntax(line_num, message))?;
    }
    Ok(Instruction::Expose { ports })
}

/// Normalize `8080` to `8080/tcp`, validating the number and protocol.
pub(crate) fn normalize_port(port: &str) -> std::result::Result<String, String> {
    let (number, proto) = match port.split_once('/') {
        Some((number, proto)) => (number, proto.to_ascii_lowercase()),
        None => (port, "tcp".to_string()),
    };
    if proto != "tcp" && proto != "udp" && proto != "sctp" {
        return Err(format!("Invalid port protocol in '{}'", port));
    }
    match number.parse::<u16>() {
        Ok(n) if n > 0 => Ok(format!("{}/{}", n, proto)),
        _ => Err(format!("Invalid port '{}'", port)),
    }
}

fn parse_user(rest: &str, line_num: usize) -> Result<Instruction> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [user] => Ok(Instruction::User {
            user: user.to_string(),
        }),
        [] => Err(syntax(line_num, "USER requires a username".to_string())),
        _ => Err(syntax(line_num, "USER takes exactly one argument".to_string())),
    }
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    let words = shell_words::split(rest)
        .map_err(|e| syntax(line_num, format!("Invalid ARG arguments: {}", e)))?;
    let word = match words.as_slice() {
        [word] => word.as_str(),
        [] => return Err(syntax(line_num, "ARG requires a name".to_string())),
        _ => return Err(syntax(line_num, "ARG takes exactly one argument".to_string())),
    };

    let (name, default) = match word.split_once('=') {
        Some((name, value)) => (name, Some(value.to_string())),
        None => (word, None),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(syntax(line_num, format!("Invalid ARG name '{}'", name)));
    }

    Ok(Instruction::Arg {
        name: name.to_string(),
        default,
    })
}

// --- Helpers ---

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| syntax(line_num, format!("Invalid JSON array '{}': {}", s, e)))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

use std::io::IsTerminal;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Instant;

const BANNER_WIDTH: usize = 72;
const KEY_WIDTH: usize = 16;
const TITLE: &str = "c y c l e k e e p e r";
const TAG_WIDTH: usize = 7;

static COLOR_ENABLED: OnceLock<bool> = OnceLock::new();
static LOG_START: OnceLock<Instant> = OnceLock::new();
static OUTPUT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Level {
    Info,
    Success,
    Warn,
    Error,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERR",
        }
    }

    fn badge_style(self) -> &'static str {
        match self {
            Self::Info => "48;5;24;1;97",
            Self::Success => "48;5;22;1;97",
            Self::Warn => "48;5;172;1;30",
            Self::Error => "48;5;124;1;97",
        }
    }

    fn text_style(self) -> &'static str {
        match self {
            Self::Info => "38;5;152",
            Self::Success => "38;5;114",
            Self::Warn => "38;5;222",
            Self::Error => "38;5;210",
        }
    }

    fn to_stderr(self) -> bool {
        matches!(self, Self::Warn | Self::Error)
    }
}

pub(crate) fn info(tag: &str, message: impl AsRef<str>) {
    emit(Level::Info, tag, message.as_ref());
}

pub(crate) fn success(tag: &str, message: impl AsRef<str>) {
    emit(Level::Success, tag, message.as_ref());
}

pub(crate) fn warn(tag: &str, message: impl AsRef<str>) {
    emit(Level::Warn, tag, message.as_ref());
}

pub(crate) fn error(tag: &str, message: impl AsRef<str>) {
    emit(Level::Error, tag, message.as_ref());
}

/// Boxed key/value summary printed once at startup.
pub(crate) fn startup_banner(lines: &[(&str, String)]) {
    let colors = use_color();
    let _guard = lock(output_lock());
    println!();
    println!("{}", paint(&border('╭', '╮'), "1;36", colors));
    println!("{}", boxed_row(&centered(TITLE), "1;97", colors));
    println!("{}", paint(&border('├', '┤'), "1;36", colors));
    for (key, value) in lines {
        println!("{}", boxed_kv(key, value, colors));
    }
    println!("{}", paint(&border('╰', '╯'), "1;36", colors));
    println!();
}

fn emit(level: Level, tag: &str, message: &str) {
    let colors = use_color();
    let elapsed = format!("{:>7.1}s", log_elapsed_secs());
    let badge = format!(" {:^4} ", level.label());
    let tag_text = format!(" {:<width$} ", tag, width = TAG_WIDTH);
    let prefix_width = elapsed.chars().count() + badge.chars().count() + tag_text.chars().count() + 3;

    let max_body = if output_is_terminal() {
        terminal_columns().saturating_sub(prefix_width).max(16)
    } else {
        usize::MAX
    };
    let body = highlight(&constrain_line(message, max_body), level.text_style(), colors);
    let line = format!(
        "{} {} {} {}",
        paint(&elapsed, "2;37", colors),
        paint(&badge, level.badge_style(), colors),
        paint(&tag_text, "48;5;237;1;252", colors),
        body
    );

    let _guard = lock(output_lock());
    if level.to_stderr() {
        eprintln!("{line}");
    } else {
        println!("{line}");
    }
}

fn border(left: char, right: char) -> String {
    format!("{left}{}{right}", "─".repeat(BANNER_WIDTH))
}

fn centered(text: &str) -> String {
    format!("{:^width$}", clip(text, BANNER_WIDTH), width = BANNER_WIDTH)
}

fn boxed_row(text: &str, style: &str, colors: bool) -> String {
    let padded = format!("{:<width$}", clip(text, BANNER_WIDTH), width = BANNER_WIDTH);
    format!(
        "{}{}{}",
        paint("│", "1;36", colors),
        paint(&padded, style, colors),
        paint("│", "1;36", colors)
    )
}

fn boxed_kv(key: &str, value: &str, colors: bool) -> String {
    let key_text = format!("{:<width$}", format!("{key}:"), width = KEY_WIDTH);
    let value_room = BANNER_WIDTH.saturating_sub(KEY_WIDTH + 3);
    let value_text = clip(value, value_room);
    let used = 2 + KEY_WIDTH + 1 + value_text.chars().count();
    format!(
        "{}  {} {}{}{}",
        paint("│", "1;36", colors),
        paint(&key_text, "1;96", colors),
        paint(&value_text, "1;97", colors),
        " ".repeat(BANNER_WIDTH.saturating_sub(used)),
        paint("│", "1;36", colors)
    )
}

/// Colors `key=value` pairs and numbers inside a log line.
fn highlight(message: &str, base_style: &str, colors: bool) -> String {
    if !colors {
        return message.to_string();
    }
    message
        .split(' ')
        .map(|word| highlight_word(word, base_style))
        .collect::<Vec<_>>()
        .join(" ")
}

fn highlight_word(word: &str, base_style: &str) -> String {
    if word == "|" {
        return paint("│", "2;37", true);
    }
    if let Some((key, value)) = word.split_once('=') {
        if !key.is_empty() && !value.is_empty() {
            return format!(
                "{}{}{}",
                paint(key, "1;94", true),
                paint("=", "2;37", true),
                paint(value, "1;97", true)
            );
        }
    }
    if has_digit(word) {
        return paint(word, "1;96", true);
    }
    paint(word, base_style, true)
}

fn has_digit(word: &str) -> bool {
    word.chars().any(|ch| ch.is_ascii_digit())
}

fn clip(text: &str, max_width: usize) -> String {
    text.chars().take(max_width).collect()
}

fn constrain_line(message: &str, max_chars: usize) -> String {
    if max_chars == usize::MAX || message.chars().count() <= max_chars {
        return message.to_string();
    }
    if max_chars <= 3 {
        return ".".repeat(max_chars);
    }
    let mut out: String = message.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

fn log_elapsed_secs() -> f64 {
    LOG_START.get_or_init(Instant::now).elapsed().as_secs_f64()
}

fn use_color() -> bool {
    *COLOR_ENABLED.get_or_init(|| {
        if std::env::var_os("CLICOLOR_FORCE").is_some_and(|force| force != "0") {
            return true;
        }
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }
        if std::env::var("TERM").is_ok_and(|term| term.eq_ignore_ascii_case("dumb")) {
            return false;
        }
        output_is_terminal()
    })
}

fn output_is_terminal() -> bool {
    std::io::stdout().is_terminal() || std::io::stderr().is_terminal()
}

fn terminal_columns() -> usize {
    columns_from(
        crossterm::terminal::size().map(|(cols, _)| cols as usize).ok(),
        std::env::var("COLUMNS").ok().as_deref(),
    )
}

fn columns_from(tty_cols: Option<usize>, env_cols: Option<&str>) -> usize {
    tty_cols
        .or_else(|| env_cols.and_then(|raw| raw.trim().parse::<usize>().ok()))
        .filter(|cols| *cols >= 40)
        .unwrap_or(100)
}

fn paint(text: &str, style: &str, enabled: bool) -> String {
    if enabled && !text.is_empty() {
        format!("\x1b[{style}m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}

fn output_lock() -> &'static Mutex<()> {
    OUTPUT_LOCK.get_or_init(|| Mutex::new(()))
}

fn lock<T>(mutex: &'static Mutex<T>) -> MutexGuard<'static, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_prefers_terminal_then_environment() {
        assert_eq!(columns_from(Some(80), Some("132")), 80);
        assert_eq!(columns_from(None, Some(" 132 ")), 132);
        assert_eq!(columns_from(None, Some("wide")), 100);
        assert_eq!(columns_from(Some(20), None), 100);
        assert_eq!(columns_from(None, None), 100);
    }

    #[test]
    fn long_lines_are_cut_with_ellipsis() {
        assert_eq!(constrain_line("remaining=23:59:59", 10), "remaini...");
        assert_eq!(constrain_line("short", 10), "short");
        assert_eq!(constrain_line("abcdef", 2), "..");
        assert_eq!(constrain_line("abcdef", usize::MAX), "abcdef");
    }

    #[test]
    fn plain_output_leaves_message_untouched() {
        assert_eq!(
            highlight("reward=0.125 | source=countdown", "0", false),
            "reward=0.125 | source=countdown"
        );
    }

    #[test]
    fn key_value_pairs_are_painted() {
        let word = highlight_word("reward=0.125", "0");
        assert!(word.contains("\x1b[1;94mreward"));
        assert!(word.contains("\x1b[1;97m0.125"));
    }

    #[test]
    fn banner_rows_keep_frame_width() {
        let row = boxed_kv("api", "http://localhost:3000".to_string().as_str(), false);
        assert_eq!(row.chars().count(), BANNER_WIDTH + 2);
        assert_eq!(centered(TITLE).chars().count(), BANNER_WIDTH);
    }
}

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Value of `--name value` or `--name=value` in the process arguments.
pub fn arg_value(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    find_value(&args, name)
}

pub fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|a| a == name)
}

pub fn db_path_arg() -> Option<PathBuf> {
    arg_value("--db").map(PathBuf::from)
}

pub fn find_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&prefix) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
            && !next.starts_with("--")
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_flag_forms_resolve() {
        let args: Vec<String> = ["--db", "a.db", "--out=x.xlsx", "--reset"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(find_value(&args, "--db").as_deref(), Some("a.db"));
        assert_eq!(find_value(&args, "--out").as_deref(), Some("x.xlsx"));
        assert_eq!(find_value(&args, "--reset"), None);
    }
}

use procmon_probe_abi::MAX_PIDS;

use crate::error::ConfigError;

/// Parses the `-p` argument: a comma-separated pid list, capped at the
/// size of the kernel-side filter map.
pub fn parse_pid_list(arg: &str) -> Result<Vec<i32>, ConfigError> {
    let mut pids = Vec::new();
    for part in arg.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let pid: i32 = part
            .parse()
            .map_err(|_| ConfigError::InvalidPid(part.to_string()))?;
        if pid < 0 {
            return Err(ConfigError::InvalidPid(part.to_string()));
        }
        pids.push(pid);
    }
    if pids.len() > MAX_PIDS {
        return Err(ConfigError::TooManyPids {
            max: MAX_PIDS,
            got: pids.len(),
        });
    }
    Ok(pids)
}

/// Parses the `-e` argument into syscall names. Validation against the
/// host's schema happens later, once the schema has been collected.
pub fn parse_event_list(arg: &str) -> Vec<String> {
    arg.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_list_roundtrips() {
        assert_eq!(parse_pid_list("1,2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_pid_list(" 42 ").unwrap(), vec![42]);
        assert!(parse_pid_list("").unwrap().is_empty());
    }

    #[test]
    fn pid_list_rejects_garbage() {
        assert!(matches!(
            parse_pid_list("1,x"),
            Err(ConfigError::InvalidPid(_))
        ));
        assert!(matches!(
            parse_pid_list("-5"),
            Err(ConfigError::InvalidPid(_))
        ));
    }

    #[test]
    fn pid_list_enforces_filter_map_capacity() {
        let arg = (0..11).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        assert!(matches!(
            parse_pid_list(&arg),
            Err(ConfigError::TooManyPids { max: 10, got: 11 })
        ));
    }

    #[test]
    fn event_list_splits_and_trims() {
        assert_eq!(
            parse_event_list("openat, close,read"),
            vec!["openat", "close", "read"]
        );
    }
}

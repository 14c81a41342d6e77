//! `.env` 파일 파싱
//!
//! `dotenvy` 로 `KEY=VALUE` 줄을 읽는다. 빈 줄과 `#` 주석은 건너뛰고,
//! 해석할 수 없는 줄은 경고만 남기고 버린다. 따옴표로 감싼 값은 따옴표가 벗겨진다.

use std::path::Path;

/// 문자열 내용 파싱
pub fn parse(content: &str) -> Vec<(String, String)> {
    collect(dotenvy::from_read_iter(content.as_bytes()))
}

/// 파일이 없으면 빈 목록
pub fn read(path: &Path) -> Vec<(String, String)> {
    match dotenvy::from_path_iter(path) {
        Ok(iter) => collect(iter),
        Err(e) => {
            if !e.not_found() {
                tracing::warn!("[Config] Cannot read {}: {}", path.display(), e);
            }
            Vec::new()
        }
    }
}

fn collect<I>(iter: I) -> Vec<(String, String)>
where
    I: Iterator<Item = dotenvy::Result<(String, String)>>,
{
    let mut entries = Vec::new();
    for item in iter {
        match item {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("[Config] Failed to parse .env entry: {}", e),
        }
    }
    entries
}

/// 마지막으로 정의된 값
pub fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_comments_blanks_and_malformed_lines() {
        let entries = parse("# comment\n\nMUSIC_ROOT=/music\nnot an assignment\nEMPTY=\n");
        assert_eq!(
            entries,
            vec![
                ("MUSIC_ROOT".to_string(), "/music".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn quoted_values_are_unquoted() {
        let entries = parse("ARCHIVES_ROOT=\"/srv/my archives\"\nMUSIC_ROOT='/srv/music'");
        assert_eq!(lookup(&entries, "ARCHIVES_ROOT"), Some("/srv/my archives"));
        assert_eq!(lookup(&entries, "MUSIC_ROOT"), Some("/srv/music"));
    }

    #[test]
    fn value_keeps_extra_equals_signs() {
        let entries = parse("DATABASE_URL=sqlite:///a?mode=ro");
        assert_eq!(lookup(&entries, "DATABASE_URL"), Some("sqlite:///a?mode=ro"));
    }

    #[test]
    fn lookup_prefers_last_definition() {
        let entries = parse("A=1\nA=2");
        assert_eq!(lookup(&entries, "A"), Some("2"));
        assert_eq!(lookup(&entries, "B"), None);
    }

    #[test]
    fn reads_entries_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# scdl-web\nMUSIC_ROOT=/data/music\n").unwrap();
        assert_eq!(lookup(&read(&path), "MUSIC_ROOT"), Some("/data/music"));
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&dir.path().join(".env")).is_empty());
    }
}

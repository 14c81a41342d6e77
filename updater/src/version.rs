//! 릴리스 태그 버전 비교 유틸리티
//!
//! 태그는 `v1.4.0`, `1.4`, `1.4.0-rc.1` 같은 형식으로 들어온다.
//! 비교는 (major, minor, patch) 세 숫자만 사용하며, 각 컴포넌트의
//! `-suffix` 는 버린다. 숫자로 읽을 수 없는 컴포넌트는 0으로 본다.

use std::cmp::Ordering;
use std::fmt;

/// 개발 빌드의 버전 문자열
pub const DEV_VERSION: &str = "dev";

/// (major, minor, patch) 버전
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    /// 관대한 파싱: 없는 컴포넌트와 숫자가 아닌 컴포넌트는 0
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let s = s.strip_prefix('v').or_else(|| s.strip_prefix('V')).unwrap_or(s);

        let mut parts = s.split('.').map(parse_component);
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }
}

fn parse_component(part: &str) -> u64 {
    let numeric = part.split(['-', '+']).next().unwrap_or("");
    numeric.trim().parse().unwrap_or(0)
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 두 버전 문자열을 비교한다. `Equal` 은 세 숫자가 모두 같을 때뿐이다.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    SemVer::parse(a).cmp(&SemVer::parse(b))
}

/// 릴리스되지 않은 개발 빌드인지 (`dev` 또는 빈 문자열)
pub fn is_dev_build(version: &str) -> bool {
    let v = version.trim();
    v.is_empty() || v.eq_ignore_ascii_case(DEV_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let v = SemVer::parse("1.2.3");
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 3));
    }

    #[test]
    fn parse_with_v_prefix_and_short_forms() {
        assert_eq!(SemVer::parse("v1.4"), SemVer { major: 1, minor: 4, patch: 0 });
        assert_eq!(SemVer::parse("2"), SemVer { major: 2, minor: 0, patch: 0 });
        assert_eq!(SemVer::parse(""), SemVer::default());
    }

    #[test]
    fn suffix_is_ignored_per_component() {
        assert_eq!(compare_versions("v1.4.0-rc.1", "1.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.4-beta.0", "1.4.0"), Ordering::Equal);
        assert_eq!(SemVer::parse("1.2.3+build.7").patch, 3);
    }

    #[test]
    fn garbage_components_read_as_zero() {
        assert_eq!(SemVer::parse("v1.x.5"), SemVer { major: 1, minor: 0, patch: 5 });
    }

    #[test]
    fn ordering() {
        assert_eq!(compare_versions("v1.4.0", "v1.3.9"), Ordering::Greater);
        assert_eq!(compare_versions("v1.3.9", "v1.4.0"), Ordering::Less);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0", "1.99.99"), Ordering::Greater);
    }

    #[test]
    fn compare_is_antisymmetric() {
        let samples = ["v1.4.0", "1.3.9", "1.4", "0.0.1", "v2.0.0-rc.2", "dev", "1.10.0"];
        for a in samples {
            for b in samples {
                assert_eq!(compare_versions(a, b), compare_versions(b, a).reverse(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn dev_build_detection() {
        assert!(is_dev_build("dev"));
        assert!(is_dev_build(""));
        assert!(is_dev_build(" DEV "));
        assert!(!is_dev_build("v1.3.9"));
    }
}

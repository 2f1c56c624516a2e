//! Version-number heuristic.
//!
//! Compiler `--version` banners bury the interesting number in prose. The
//! guess scans for runs of digits and dots and picks the run with the most
//! dots; ties go to the earliest occurrence.

/// Extract the most version-looking substring, if any.
#[must_use]
pub fn guess_version(src: &str) -> Option<&str> {
    let bytes = src.as_bytes();
    let mut best: Option<(usize, usize, u32)> = None; // (start, len, dots)
    let mut i = 0;
    while i < bytes.len() {
        let mut len = 0;
        let mut dots = 0;
        while i + len < bytes.len() {
            let b = bytes[i + len];
            if b == b'.' {
                dots += 1;
            } else if !b.is_ascii_digit() {
                break;
            }
            len += 1;
        }
        if len > 0 {
            if dots > best.map_or(0, |(_, _, d)| d) {
                best = Some((i, len, dots));
            }
            i += len;
        } else {
            i += 1;
        }
    }
    best.map(|(start, len, _)| &src[start..start + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("gcc (GCC) 13.2.1 20230801", Some("13.2.1"))]
    #[case("clang version 17.0.6 (Fedora 17.0.6-1)", Some("17.0.6"))]
    #[case("cc: error", None)]
    #[case("1.2 then 3.4.5", Some("3.4.5"))]
    #[case("2.0.0 and 3.1.1", Some("2.0.0"))]
    fn guesses_the_dottiest_run(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(guess_version(input), expected);
    }
}

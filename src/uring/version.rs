use nix::sys::utsname::uname;

use crate::uring::errors::IoError;

/// Oldest kernel with everything the engine relies on (notably
/// single-issuer SQPOLL rings and multi-shot poll on signal-fds).
const MIN_KERNEL: (u32, u32, u32) = (6, 8, 0);

/// Lenient "major.minor.patch" prefix parse of a kernel release string.
///
/// Stops at the third dot or at the first character that is neither a
/// digit nor a dot after a version numeral, so `"6.12.3-arch1-1"` and
/// `"6.8.0-rc1"` both parse. Missing components default to zero.
pub(crate) fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let mut nums = [0u32; 3];
    let mut seen = 0;

    for piece in release.split('.') {
        if seen == 3 {
            break;
        }

        let end = piece
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(piece.len());
        if end == 0 {
            break;
        }

        nums[seen] = piece[..end].parse().ok()?;
        seen += 1;

        // Trailing junk ("0-rc1") ends the version numeral.
        if end != piece.len() {
            break;
        }
    }

    if seen == 0 {
        return None;
    }
    Some((nums[0], nums[1], nums[2]))
}

/// Gate: the running kernel must be at least 6.8.0.
pub(crate) fn check_supported() -> Result<(), IoError> {
    let uts = uname().map_err(|e| IoError::Unsupported(format!("uname failed: {e}")))?;
    let release = uts.release().to_string_lossy();

    match parse_release(&release) {
        Some(version) if version >= MIN_KERNEL => Ok(()),
        Some((major, minor, patch)) => Err(IoError::Unsupported(format!(
            "kernel {major}.{minor}.{patch} is older than the required 6.8.0"
        ))),
        None => Err(IoError::Unsupported(format!(
            "cannot parse kernel release {release:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("6.8.0", Some((6, 8, 0)))]
    #[case::two_components("10.0", Some((10, 0, 0)))]
    #[case::rc_suffix("6.8.0-rc1", Some((6, 8, 0)))]
    #[case::distro_suffix("6.12.3-arch1-1", Some((6, 12, 3)))]
    #[case::junk_in_minor("6.8rc-2", Some((6, 8, 0)))]
    #[case::extra_components("5.15.0.1023", Some((5, 15, 0)))]
    #[case::nonsense("funky", None)]
    #[case::empty("", None)]
    fn lenient_release_parse(#[case] release: &str, #[case] expected: Option<(u32, u32, u32)>) {
        assert_eq!(parse_release(release), expected);
    }

    #[rstest]
    #[case::old_major((5, 19, 17), false)]
    #[case::old_minor((6, 7, 12), false)]
    #[case::exact((6, 8, 0), true)]
    #[case::newer((6, 12, 1), true)]
    fn version_gate(#[case] version: (u32, u32, u32), #[case] ok: bool) {
        assert_eq!(version >= MIN_KERNEL, ok);
    }
}

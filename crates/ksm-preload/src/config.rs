use core::ffi::CStr;

/// Environment variable overriding the merge threshold, in bytes.
pub const MERGE_THRESHOLD_ENV: &CStr = c"KSMP_MERGE_THRESHOLD";

/// Regions of at most this many bytes (after page alignment) are left alone.
/// Eight pages on a 4 KiB system.
pub const DEFAULT_MERGE_THRESHOLD: usize = 4096 * 8;

/// Largest threshold accepted; bigger values are clamped to it.
pub const MAX_MERGE_THRESHOLD: usize = i32::MAX as usize;

/// Outcome of reading the threshold variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSetting {
    /// Unset or empty: keep the default.
    Unset,
    Valid(usize),
    /// Not a non-negative decimal integer: keep the default.
    Invalid,
    /// Above [`MAX_MERGE_THRESHOLD`].
    Clamped(usize),
}

impl ThresholdSetting {
    /// The threshold to use given the current default.
    pub fn resolve(self, default: usize) -> usize {
        match self {
            ThresholdSetting::Valid(v) | ThresholdSetting::Clamped(v) => v,
            ThresholdSetting::Unset | ThresholdSetting::Invalid => default,
        }
    }
}

/// Parse a threshold the way `strtol(s, &end, 10)` would, then validate it.
///
/// Leading whitespace and a sign are accepted. Anything after the digits,
/// a missing number, or a negative value is invalid. Never allocates.
pub fn parse_threshold(raw: Option<&[u8]>) -> ThresholdSetting {
    let bytes = match raw {
        None => return ThresholdSetting::Unset,
        Some(b) if b.is_empty() => return ThresholdSetting::Unset,
        Some(b) => b,
    };

    let mut i = 0;
    while i < bytes.len() && is_c_space(bytes[i]) {
        i += 1;
    }

    let mut negative = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        negative = bytes[i] == b'-';
        i += 1;
    }

    let digits_start = i;
    let mut value: u64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        value = value
            .saturating_mul(10)
            .saturating_add((bytes[i] - b'0') as u64);
        i += 1;
    }

    if i == digits_start || i != bytes.len() {
        return ThresholdSetting::Invalid;
    }
    if negative && value != 0 {
        return ThresholdSetting::Invalid;
    }
    if value > MAX_MERGE_THRESHOLD as u64 {
        return ThresholdSetting::Clamped(MAX_MERGE_THRESHOLD);
    }
    ThresholdSetting::Valid(value as usize)
}

/// Read and parse [`MERGE_THRESHOLD_ENV`], reporting bad values on stderr.
///
/// # Safety
/// Calls `libc::getenv`, which races with concurrent `setenv`.
pub unsafe fn read_merge_threshold() -> usize {
    let raw = getenv_bytes(MERGE_THRESHOLD_ENV);
    let setting = parse_threshold(raw);
    match setting {
        ThresholdSetting::Invalid => {
            warn!(
                "invalid environment variable {}={}, a non-negative integer was expected",
                Shown(MERGE_THRESHOLD_ENV.to_bytes()),
                Shown(raw.unwrap_or_default())
            );
        }
        ThresholdSetting::Clamped(v) => {
            warn!(
                "truncated {} to INT_MAX ({})",
                Shown(MERGE_THRESHOLD_ENV.to_bytes()),
                v
            );
        }
        ThresholdSetting::Unset | ThresholdSetting::Valid(_) => {}
    }
    setting.resolve(DEFAULT_MERGE_THRESHOLD)
}

/// # Safety
/// Calls `libc::getenv`.
unsafe fn getenv_bytes(key: &CStr) -> Option<&'static [u8]> {
    let val = libc::getenv(key.as_ptr());
    if val.is_null() {
        None
    } else {
        Some(CStr::from_ptr(val).to_bytes())
    }
}

fn is_c_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Displays raw environment bytes without allocating; non-UTF-8 bytes as `?`.
struct Shown<'a>(&'a [u8]);

impl core::fmt::Display for Shown<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for chunk in self.0.utf8_chunks() {
            f.write_str(chunk.valid())?;
            if !chunk.invalid().is_empty() {
                f.write_str("?")?;
            }
        }
        Ok(())
    }
}

// Copyright (c) 2024-present, tundra-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Gets the unix timestamp as a duration
pub fn unix_timestamp() -> std::time::Duration {
    #[cfg(test)]
    {
        if let Some(cell) = NOW_OVERRIDE.get() {
            if let Some(override_val) = *cell.lock().expect("lock is poisoned") {
                return override_val;
            }
        }
    }

    let now = std::time::SystemTime::now();

    #[allow(clippy::expect_used)]
    now.duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("time went backwards")
}

/// Gets the unix timestamp in whole seconds, truncated to the width
/// stored in record headers.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_timestamp_secs() -> u32 {
    unix_timestamp().as_secs() as u32
}

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
static NOW_OVERRIDE: OnceLock<Mutex<Option<std::time::Duration>>> = OnceLock::new();

#[cfg(test)]
pub(crate) fn set_unix_timestamp_for_test(value: Option<std::time::Duration>) {
    let cell = NOW_OVERRIDE.get_or_init(|| Mutex::new(None));
    *cell.lock().expect("lock is poisoned") = value;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use test_log::test;

    #[test]
    fn timestamp_override() {
        super::set_unix_timestamp_for_test(Some(std::time::Duration::from_secs(42)));
        assert_eq!(42, super::unix_timestamp_secs());

        super::set_unix_timestamp_for_test(None);
        assert!(super::unix_timestamp_secs() >= 42);
    }
}

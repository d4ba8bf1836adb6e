#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error;

/// Read an environment variable, falling back to `default` when it is unset
/// or not valid unicode.
#[must_use]
pub fn default_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Error, Debug)]
pub enum EnvUsizeError {
    #[error(transparent)]
    Var(#[from] std::env::VarError),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
}

/// # Errors
///
/// * If the environment variable is missing
/// * If the value fails to parse
pub fn env_usize(name: &str) -> Result<usize, EnvUsizeError> {
    Ok(std::env::var(name)?.parse::<usize>()?)
}

#[derive(Error, Debug)]
pub enum DefaultEnvUsizeError {
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
}

/// # Errors
///
/// * If the value fails to parse
pub fn default_env_usize(name: &str, default: usize) -> Result<usize, DefaultEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(value.parse::<usize>()?),
        Err(_) => Ok(default),
    }
}

/// # Errors
///
/// * If the value fails to parse
pub fn default_env_u16(name: &str, default: u16) -> Result<u16, DefaultEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(value.parse::<u16>()?),
        Err(_) => Ok(default),
    }
}

#[derive(Error, Debug)]
pub enum OptionEnvUsizeError {
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
}

/// # Errors
///
/// * If the value fails to parse
pub fn option_env_usize(name: &str) -> Result<Option<usize>, OptionEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value.parse::<usize>()?)),
        Err(_) => Ok(None),
    }
}

/// # Errors
///
/// * If the value fails to parse
pub fn option_env_u16(name: &str) -> Result<Option<u16>, OptionEnvUsizeError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value.parse::<u16>()?)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    #[serial_test::serial]
    fn default_env_falls_back_when_unset() {
        unsafe {
            std::env::remove_var("PAIRLINK_TEST_DEFAULT_ENV");
        }

        assert_eq!(default_env("PAIRLINK_TEST_DEFAULT_ENV", "fallback"), "fallback");
    }

    #[test_log::test]
    #[serial_test::serial]
    fn default_env_reads_the_variable_when_set() {
        unsafe {
            std::env::set_var("PAIRLINK_TEST_DEFAULT_ENV", "value");
        }

        assert_eq!(default_env("PAIRLINK_TEST_DEFAULT_ENV", "fallback"), "value");

        unsafe {
            std::env::remove_var("PAIRLINK_TEST_DEFAULT_ENV");
        }
    }

    #[test_log::test]
    #[serial_test::serial]
    fn default_env_usize_parses_and_falls_back() {
        unsafe {
            std::env::remove_var("PAIRLINK_TEST_USIZE");
        }

        assert_eq!(default_env_usize("PAIRLINK_TEST_USIZE", 64).unwrap(), 64);

        unsafe {
            std::env::set_var("PAIRLINK_TEST_USIZE", "128");
        }

        assert_eq!(default_env_usize("PAIRLINK_TEST_USIZE", 64).unwrap(), 128);

        unsafe {
            std::env::set_var("PAIRLINK_TEST_USIZE", "not a number");
        }

        assert!(default_env_usize("PAIRLINK_TEST_USIZE", 64).is_err());

        unsafe {
            std::env::remove_var("PAIRLINK_TEST_USIZE");
        }
    }

    #[test_log::test]
    #[serial_test::serial]
    fn option_env_u16_is_none_when_unset() {
        unsafe {
            std::env::remove_var("PAIRLINK_TEST_U16");
        }

        assert_eq!(option_env_u16("PAIRLINK_TEST_U16").unwrap(), None);

        unsafe {
            std::env::set_var("PAIRLINK_TEST_U16", "8080");
        }

        assert_eq!(option_env_u16("PAIRLINK_TEST_U16").unwrap(), Some(8080));

        unsafe {
            std::env::remove_var("PAIRLINK_TEST_U16");
        }
    }
}

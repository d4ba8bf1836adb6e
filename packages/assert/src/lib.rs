#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

pub use colored;
pub use log;
pub use pairlink_env_utils;

/// Whether hard assertions are enabled for this process.
///
/// Controlled by the `ENABLE_ASSERT` environment variable. Off by default so
/// production deployments log instead of dying.
#[macro_export]
macro_rules! enabled {
    () => {
        $crate::pairlink_env_utils::default_env("ENABLE_ASSERT", "false") == "1"
    };
}

#[macro_export]
macro_rules! die {
    ($($message:tt)+) => {{
        use $crate::colored::Colorize as _;

        let message = format!($($message)+);
        eprintln!("{}", message.as_str().red());
        eprintln!("{}", std::backtrace::Backtrace::force_capture());
        std::process::exit(1);
    }};
}

#[macro_export]
macro_rules! assert {
    ($evaluate:expr $(,)?) => {
        if $crate::enabled!() && !($evaluate) {
            eprintln!(
                "assert failed:\n{}",
                std::backtrace::Backtrace::force_capture()
            );
            std::process::exit(1);
        }
    };
    ($evaluate:expr, $($message:tt)+) => {
        if $crate::enabled!() && !($evaluate) {
            eprintln!(
                "assert failed: \"{}\"\n{}",
                format!($($message)+),
                std::backtrace::Backtrace::force_capture()
            );
            std::process::exit(1);
        }
    };
}

#[macro_export]
macro_rules! die_or_panic {
    ($($message:tt)+) => {{
        if $crate::enabled!() {
            $crate::die!($($message)+);
        }
        panic!($($message)+);
    }};
}

#[macro_export]
macro_rules! die_or_error {
    ($($message:tt)+) => {
        if $crate::enabled!() {
            $crate::die!($($message)+);
        } else {
            $crate::log::error!($($message)+);
        }
    };
}

#[macro_export]
macro_rules! die_or_warn {
    ($($message:tt)+) => {
        if $crate::enabled!() {
            $crate::die!($($message)+);
        } else {
            $crate::log::warn!($($message)+);
        }
    };
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `[Component] message` logging through the `log` facade.
//!
//! When structured logging is on, `slog_stdlog` carries these records into
//! `slog`, so call sites never care which backend is active.

#[doc(hidden)]
#[macro_export]
macro_rules! component_log {
    ($level:expr, $component:expr, $($arg:tt)+) => {
        log::log!($level, "[{}] {}", $component, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! error_fmt {
    ($component:expr, $($arg:tt)+) => {
        $crate::component_log!(log::Level::Error, $component, $($arg)+)
    };
}

#[macro_export]
macro_rules! warn_fmt {
    ($component:expr, $($arg:tt)+) => {
        $crate::component_log!(log::Level::Warn, $component, $($arg)+)
    };
}

#[macro_export]
macro_rules! info_fmt {
    ($component:expr, $($arg:tt)+) => {
        $crate::component_log!(log::Level::Info, $component, $($arg)+)
    };
}

#[macro_export]
macro_rules! debug_fmt {
    ($component:expr, $($arg:tt)+) => {
        $crate::component_log!(log::Level::Debug, $component, $($arg)+)
    };
}

#[macro_export]
macro_rules! trace_fmt {
    ($component:expr, $($arg:tt)+) => {
        $crate::component_log!(log::Level::Trace, $component, $($arg)+)
    };
}

#[macro_export]
macro_rules! emit_debug {
    ($sink:expr, $component:expr, $($arg:tt)+) => {
        $crate::telemetry::Telemetry::emit(&*$sink, $crate::telemetry::Severity::Debug, $component, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! emit_info {
    ($sink:expr, $component:expr, $($arg:tt)+) => {
        $crate::telemetry::Telemetry::emit(&*$sink, $crate::telemetry::Severity::Info, $component, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! emit_warn {
    ($sink:expr, $component:expr, $($arg:tt)+) => {
        $crate::telemetry::Telemetry::emit(&*$sink, $crate::telemetry::Severity::Warn, $component, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! emit_error {
    ($sink:expr, $component:expr, $($arg:tt)+) => {
        $crate::telemetry::Telemetry::emit(&*$sink, $crate::telemetry::Severity::Error, $component, format_args!($($arg)+))
    };
}

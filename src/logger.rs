// Level macros switched on by the `log_*` cargo features. Enabling a level
// enables every less verbose level as well (see Cargo.toml).
//
// `cfg!` keeps the disabled branches type-checked, so arguments that are only
// used for logging do not trigger unused warnings.

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_trace") {
            eprintln!("[TRACE] {}:{} {}", file!(), line!(), format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_debug") {
            eprintln!("[DEBUG] {}:{} {}", file!(), line!(), format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_info") {
            eprintln!("[INFO] {}:{} {}", file!(), line!(), format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_warn") {
            eprintln!("[WARN] {}:{} {}", file!(), line!(), format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if cfg!(feature = "log_error") {
            eprintln!("[ERROR] {}:{} {}", file!(), line!(), format_args!($($arg)*));
        }
    };
}

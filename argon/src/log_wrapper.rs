//! Logging macros that forward to `log` or `defmt` depending on the enabled feature.
//! Format strings must stay within the subset both backends accept (`{}` only).

macro_rules! dispatch_log {
    ( $level:ident, $( $arg:expr ),+ ) => {
        {
            #[cfg(feature = "log")]
            log::$level!( $( $arg ),+ );
            #[cfg(feature = "defmt")]
            defmt::$level!( $( $arg ),+ );
            #[cfg(not(any(feature = "log", feature = "defmt")))]
            {
                $( let _ = &$arg; )+
            }
        }
    };
}

macro_rules! info {
    ( $( $arg:expr ),+ ) => { $crate::log_wrapper::dispatch_log!(info, $( $arg ),+ ) };
}

macro_rules! debug {
    ( $( $arg:expr ),+ ) => { $crate::log_wrapper::dispatch_log!(debug, $( $arg ),+ ) };
}

macro_rules! trace {
    ( $( $arg:expr ),+ ) => { $crate::log_wrapper::dispatch_log!(trace, $( $arg ),+ ) };
}

macro_rules! log_warn {
    ( $( $arg:expr ),+ ) => { $crate::log_wrapper::dispatch_log!(warn, $( $arg ),+ ) };
}

pub(crate) use {debug, dispatch_log, info, log_warn, trace};

//! Global Configuration
//!
//! [`RuntimeOptions`] is built once before any engine starts and is shared
//! read-only (`Arc<RuntimeOptions>`) by the lifecycle controller and every
//! engine. Options come from argv-style vectors, from the `LPM_OPTIONS`
//! environment variable, or from a JSON file.
//!
//! # Option letters
//! ```text
//! -a          search for all solutions (benchmark mode)
//! -c          check stack balance after each run
//! -C<kb>      primary cache size hint
//! -d<x>       diagnostic toggle (b c d g G s h f p m r t, or a for most)
//! -D<i|e>     enable tracing with the internal or external handler
//! -p          disable profiling
//! -P<n>       engine thread count
//! -r<n>       repeat the run n times
//! -s<z><kb>   zone size            (z: h d n t s g)
//! -t          use own timer, clears all diagnostic toggles
//! -T<r|v|p>   time profiling by real, user or user+system time
//! -x          disable the garbage collector
//! -z<z><kb>   redzone size         (z: h d n t s g)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::ConfigError;
use crate::memory::ZoneKind;

/// Environment variable holding an option string.
pub const OPTIONS_ENV_VAR: &str = "LPM_OPTIONS";

/// Size of one zone and of its redzone, in kilobytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSize {
    pub size_kb: usize,
    pub redzone_kb: usize,
}

impl ZoneSize {
    const fn new(size_kb: usize) -> Self {
        Self {
            size_kb,
            redzone_kb: 16,
        }
    }
}

/// Sizes of the six zones every engine allocates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneLayout {
    pub heap: ZoneSize,
    pub detstack: ZoneSize,
    pub nondetstack: ZoneSize,
    pub solutions_heap: ZoneSize,
    pub global_heap: ZoneSize,
    pub trail: ZoneSize,
}

impl Default for ZoneLayout {
    fn default() -> Self {
        Self {
            heap: ZoneSize::new(4096),
            detstack: ZoneSize::new(2048),
            nondetstack: ZoneSize::new(128),
            solutions_heap: ZoneSize::new(1024),
            global_heap: ZoneSize::new(1024),
            trail: ZoneSize::new(128),
        }
    }
}

impl ZoneLayout {
    pub fn get(&self, kind: ZoneKind) -> ZoneSize {
        match kind {
            ZoneKind::Heap => self.heap,
            ZoneKind::DetStack => self.detstack,
            ZoneKind::NondetStack => self.nondetstack,
            ZoneKind::SolutionsHeap => self.solutions_heap,
            ZoneKind::GlobalHeap => self.global_heap,
            ZoneKind::Trail => self.trail,
        }
    }

    pub fn get_mut(&mut self, kind: ZoneKind) -> &mut ZoneSize {
        match kind {
            ZoneKind::Heap => &mut self.heap,
            ZoneKind::DetStack => &mut self.detstack,
            ZoneKind::NondetStack => &mut self.nondetstack,
            ZoneKind::SolutionsHeap => &mut self.solutions_heap,
            ZoneKind::GlobalHeap => &mut self.global_heap,
            ZoneKind::Trail => &mut self.trail,
        }
    }

    fn kind_for_letter(letter: char) -> Option<ZoneKind> {
        match letter {
            'h' => Some(ZoneKind::Heap),
            'd' => Some(ZoneKind::DetStack),
            'n' => Some(ZoneKind::NondetStack),
            't' => Some(ZoneKind::Trail),
            's' => Some(ZoneKind::SolutionsHeap),
            'g' => Some(ZoneKind::GlobalHeap),
            _ => None,
        }
    }
}

/// Clock used by time profiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeProfileMethod {
    #[serde(rename = "real-time")]
    RealTime,
    #[serde(rename = "user-time")]
    UserTime,
    #[default]
    #[serde(rename = "user+system-time")]
    UserPlusSystemTime,
}

impl fmt::Display for TimeProfileMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RealTime => write!(f, "real-time"),
            Self::UserTime => write!(f, "user-time"),
            Self::UserPlusSystemTime => write!(f, "user+system-time"),
        }
    }
}

/// Which debugger front end receives trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceHandler {
    #[default]
    None,
    Internal,
    External,
}

/// Low-level diagnostic toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    pub call: bool,
    pub nondetstack: bool,
    pub detstack: bool,
    pub heap: bool,
    pub goto: bool,
    pub sreg: bool,
    pub final_state: bool,
    pub trace: bool,
    pub detail: bool,
    pub prog: bool,
    pub mem: bool,
    pub gc_verbose: bool,
}

impl DebugFlags {
    pub fn any(&self) -> bool {
        *self != Self::default()
    }

    fn set(&mut self, letter: char) -> bool {
        match letter {
            'b' => self.nondetstack = true,
            'c' => self.call = true,
            'd' => self.detail = true,
            'g' => self.goto = true,
            'G' => self.gc_verbose = true,
            's' => self.detstack = true,
            'h' => self.heap = true,
            'f' => self.final_state = true,
            'p' => self.prog = true,
            'm' => self.mem = true,
            'r' => self.sreg = true,
            't' => self.trace = true,
            'a' => {
                self.call = true;
                self.nondetstack = true;
                self.detstack = true;
                self.heap = true;
                self.goto = true;
                self.sreg = true;
                self.final_state = true;
                self.trace = true;
                self.gc_verbose = true;
            }
            _ => return false,
        }
        true
    }
}

/// Immutable runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub zones: ZoneLayout,
    /// Primary cache size hint in kilobytes.
    pub pcache_kb: usize,
    pub thread_count: usize,
    pub profiling: bool,
    pub time_profile_method: TimeProfileMethod,
    pub repeats: u32,
    pub benchmark_all_solutions: bool,
    pub check_space: bool,
    pub use_own_timer: bool,
    pub gc_disabled: bool,
    pub trace_enabled: bool,
    pub trace_handler: TraceHandler,
    pub debug: DebugFlags,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            zones: ZoneLayout::default(),
            pcache_kb: 8192,
            thread_count: 1,
            profiling: true,
            time_profile_method: TimeProfileMethod::default(),
            repeats: 1,
            benchmark_all_solutions: false,
            check_space: false,
            use_own_timer: false,
            gc_disabled: false,
            trace_enabled: false,
            trace_handler: TraceHandler::default(),
            debug: DebugFlags::default(),
        }
    }
}

impl RuntimeOptions {
    /// Apply the option string in `LPM_OPTIONS`, if set.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(OPTIONS_ENV_VAR) {
            Ok(options) => Self::default().with_option_string(&options),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load a complete configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(options.normalized())
    }

    /// Clamp counts that must be at least one.
    pub fn normalized(mut self) -> Self {
        self.thread_count = self.thread_count.max(1);
        self.repeats = self.repeats.max(1);
        self
    }

    /// Return a copy with the options of a whitespace-separated option
    /// string applied.
    pub fn with_option_string(&self, options: &str) -> Result<Self, ConfigError> {
        self.with_args(split_option_string(options)?)
    }

    /// Return a copy with argv-style options applied. `self` is left
    /// untouched when any option is malformed.
    pub fn with_args<I, S>(&self, args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let mut opts = self.clone();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            i += 1;

            if arg == "--" {
                if let Some(operand) = args.get(i) {
                    return Err(ConfigError::UnexpectedOperand(operand.clone()));
                }
                break;
            }
            let flags = match arg.strip_prefix('-') {
                Some(flags) if !flags.is_empty() => flags,
                _ => return Err(ConfigError::UnexpectedOperand(arg.clone())),
            };

            for (pos, letter) in flags.char_indices() {
                if !takes_argument(letter)? {
                    opts.apply_flag(letter);
                    continue;
                }
                let attached = &flags[pos + letter.len_utf8()..];
                let value = if attached.is_empty() {
                    let value = args
                        .get(i)
                        .cloned()
                        .ok_or(ConfigError::MissingArgument(letter))?;
                    i += 1;
                    value
                } else {
                    attached.to_owned()
                };
                opts.apply_valued(letter, &value)?;
                break;
            }
        }

        debug!(?opts, "Runtime options resolved");
        Ok(opts)
    }

    fn apply_flag(&mut self, letter: char) {
        match letter {
            'a' => self.benchmark_all_solutions = true,
            'c' => self.check_space = true,
            'p' => self.profiling = false,
            't' => {
                self.use_own_timer = true;
                self.debug = DebugFlags::default();
            }
            'x' => self.gc_disabled = true,
            _ => unreachable!("flag letters are validated by takes_argument"),
        }
    }

    fn apply_valued(&mut self, letter: char, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            option: letter,
            value: value.to_owned(),
        };

        match letter {
            'C' => self.pcache_kb = value.parse().map_err(|_| invalid())?,
            'd' => {
                let mut chars = value.chars();
                let toggle = match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => return Err(invalid()),
                };
                if !self.debug.set(toggle) {
                    return Err(invalid());
                }
                self.use_own_timer = false;
            }
            'D' => {
                self.trace_handler = match value {
                    "i" => TraceHandler::Internal,
                    "e" => TraceHandler::External,
                    _ => return Err(invalid()),
                };
                self.trace_enabled = true;
            }
            'P' => {
                let count: usize = value.parse().map_err(|_| invalid())?;
                if count < 1 {
                    return Err(invalid());
                }
                self.thread_count = count;
            }
            'r' => {
                let repeats: u32 = value.parse().map_err(|_| invalid())?;
                if repeats < 1 {
                    return Err(invalid());
                }
                self.repeats = repeats;
            }
            's' | 'z' => {
                let mut chars = value.chars();
                let kind = chars
                    .next()
                    .and_then(ZoneLayout::kind_for_letter)
                    .ok_or_else(invalid)?;
                let size: usize = chars.as_str().parse().map_err(|_| invalid())?;
                if size == 0 {
                    return Err(invalid());
                }
                let zone = self.zones.get_mut(kind);
                if letter == 's' {
                    zone.size_kb = size;
                } else {
                    zone.redzone_kb = size;
                }
            }
            'T' => {
                self.time_profile_method = match value {
                    "r" => TimeProfileMethod::RealTime,
                    "v" => TimeProfileMethod::UserTime,
                    "p" => TimeProfileMethod::UserPlusSystemTime,
                    _ => return Err(invalid()),
                };
            }
            _ => unreachable!("valued letters are validated by takes_argument"),
        }
        Ok(())
    }
}

fn takes_argument(letter: char) -> Result<bool, ConfigError> {
    match letter {
        'a' | 'c' | 'p' | 't' | 'x' => Ok(false),
        'C' | 'd' | 'D' | 'P' | 'r' | 's' | 'T' | 'z' => Ok(true),
        other => Err(ConfigError::UnknownOption(other)),
    }
}

/// Split an option string into words. Double quotes group words, a
/// backslash escapes the next character.
pub fn split_option_string(options: &str) -> Result<Vec<String>, ConfigError> {
    let mut args = Vec::new();
    let mut chars = options.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut arg = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(ConfigError::UnterminatedQuote),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => arg.push(escaped),
                        None => return Err(ConfigError::UnterminatedQuote),
                    },
                    Some(c) => arg.push(c),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        arg.push(escaped);
                    }
                } else {
                    arg.push(c);
                }
            }
        }
        args.push(arg);
    }

    Ok(args)
}

/// Usage text printed when an option is malformed.
pub fn usage_message() -> String {
    format!(
        "The {} environment variable contains an invalid option.\n\
         Valid options: -a -c -C<kb> -d<x> -D<i|e> -p -P<n> -r<n> -s<z><kb> -t -T<r|v|p> -x -z<z><kb>\n\
         Zone letters: h (heap), d (det stack), n (nondet stack), t (trail), \
         s (solutions heap), g (global heap).",
        OPTIONS_ENV_VAR
    )
}

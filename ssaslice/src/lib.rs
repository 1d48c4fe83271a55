//! Backward slicing, rendering, and concrete evaluation of SSA IL, aimed at recovering what
//! obfuscated VM dispatchers and handlers compute.

pub mod analysis_config;
pub mod arch;
pub mod builder;
pub mod containers;
pub mod error;
pub mod evaluator;
pub mod expr;
pub mod graph;
pub mod il;
pub mod lifter;
pub mod memory;
pub mod render;
pub mod slicer;
pub mod tests;
pub mod vm_entry;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            if let Some(v) = &self.1 {
                v.serialize(record, self.0, serializer)
            } else {
                Ok(())
            }
        }
    }

    /// Map the number of `-d` flags onto a severity: 0-warn, 1-info, 2-debug, 3+ trace.
    fn severity(debug_level: usize) -> sloggers::types::Severity {
        use sloggers::types::Severity;
        match debug_level {
            0 => Severity::Warning,
            1 => Severity::Info,
            2 => Severity::Debug,
            _ => Severity::Trace,
        }
    }

    /// Logs to the terminal, and optionally (as JSON) to a file. When a file is given, the
    /// terminal only receives errors.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> slog::Logger {
            use sloggers::types::{Format, OverflowStrategy, Severity};
            use sloggers::Build;

            let level = severity(debug_level);

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder
                    .build()
                    .expect("null logger")
            } else {
                let blocking = force_block || path.is_none();
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if path.is_none() { level } else { Severity::Error })
                    .overflow_strategy(if blocking {
                        OverflowStrategy::Block
                    } else {
                        OverflowStrategy::DropAndReport
                    })
                    .format(Format::Compact)
                    .build()
                    .expect("terminal logger")
            };

            let file_drain = path.map(|path| {
                sloggers::file::FileLoggerBuilder::new(path)
                    .truncate()
                    .level(level)
                    .overflow_strategy(OverflowStrategy::Block)
                    .format(Format::Json)
                    .build()
                    .expect("log file")
            });

            slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            )
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}

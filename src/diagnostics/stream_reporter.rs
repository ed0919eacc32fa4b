use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::diagnostics::sender::{DiagnosticDelegate, LEVEL_ERROR, LEVEL_WARNING};


/// Builds a subscription delegate that prints diagnostic messages to a pair
/// of sinks.
///
/// Messages at [`LEVEL_ERROR`] or above go to the error sink prefixed with
/// `error: `, messages at [`LEVEL_WARNING`] or above go to the error sink
/// prefixed with `warning: `, everything else goes to the output sink. Each
/// line carries the seconds elapsed since the reporter was constructed:
///
/// ```text
/// [0.000123 NetworkConnection:10] error: error in connect (...)
/// ```
///
/// The returned delegate is thread-safe; both sinks share one internal lock.
pub fn stream_reporter<O, E>(output: O, error: E) -> DiagnosticDelegate
where
    O: Write + Send + 'static,
    E: Write + Send + 'static,
{
    let reference = Instant::now();
    let sinks = Arc::new(Mutex::new((output, error)));

    Arc::new(move |sender_name: &str, level: usize, message: &str| {
        let mut sinks = sinks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (output, error) = &mut *sinks;
        let (destination, prefix): (&mut dyn Write, &str) = if level >= LEVEL_ERROR {
            (error, "error: ")
        } else if level >= LEVEL_WARNING {
            (error, "warning: ")
        } else {
            (output, "")
        };
        let _ = writeln!(
            destination,
            "[{:.6} {}:{}] {}{}",
            reference.elapsed().as_secs_f64(),
            sender_name,
            level,
            prefix,
            message
        );
    })
}


#[cfg(test)]
mod tests {
    use crate::diagnostics::sender::DiagnosticsSender;

    use super::*;

    /// Write implementation sharing its buffer with the test body.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedSink {
        fn lines(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    #[test]
    fn test_routing_and_prefixes() {
        let output = SharedSink::default();
        let error = SharedSink::default();
        let sender = DiagnosticsSender::new("reporter");
        let _subscription = sender.subscribe(stream_reporter(output.clone(), error.clone()), 0);

        sender.publish(0, "plain");
        sender.publish(5, "watch out");
        sender.publish(10, "it broke");

        let output_lines = output.lines();
        assert_eq!(1, output_lines.len());
        assert!(output_lines[0].contains(" reporter:0] plain"));
        assert!(output_lines[0].starts_with('['));

        let error_lines = error.lines();
        assert_eq!(2, error_lines.len());
        assert!(error_lines[0].contains(" reporter:5] warning: watch out"));
        assert!(error_lines[1].contains(" reporter:10] error: it broke"));
    }
}

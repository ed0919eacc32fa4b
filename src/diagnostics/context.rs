use crate::diagnostics::sender::DiagnosticsSender;


/// Guard that keeps a context frame on a sender's contextual information
/// stack for as long as it is alive.
pub struct DiagnosticsContext {
    sender: DiagnosticsSender,
}

impl DiagnosticsContext {
    pub fn new(sender: &DiagnosticsSender, context: impl Into<String>) -> DiagnosticsContext {
        sender.push_context(context);
        DiagnosticsContext {
            sender: sender.clone(),
        }
    }
}

impl Drop for DiagnosticsContext {
    fn drop(&mut self) {
        self.sender.pop_context();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_context_frame_scoped_to_guard() {
        let sender = DiagnosticsSender::new("scoped");
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let _subscription = sender.subscribe(
            Arc::new(move |_, _, message| received_clone.lock().unwrap().push(message.to_string())),
            0,
        );

        sender.publish(0, "before");
        {
            let _context = DiagnosticsContext::new(&sender, "frame");
            sender.publish(0, "inside");
        }
        sender.publish(0, "after");

        assert_eq!(
            vec!["before", "frame: inside", "after"],
            *received.lock().unwrap()
        );
    }
}

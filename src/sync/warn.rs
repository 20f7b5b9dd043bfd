fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Recoverable anomaly worth surfacing to operators. Every field is reduced
/// to a single token so log lines stay greppable.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub conversation: &'a str,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

impl<'a> WarnEvent<'a> {
    pub fn new(code: &'a str, stage: &'a str, conversation: &'a str) -> Self {
        Self {
            code,
            stage,
            conversation,
            retry: "na",
            reason: "na",
            err: "na",
        }
    }

    pub fn retry(mut self, retry: &'a str) -> Self {
        self.retry = retry;
        self
    }

    pub fn reason(mut self, reason: &'a str) -> Self {
        self.reason = reason;
        self
    }

    pub fn err(mut self, err: &'a str) -> Self {
        self.err = err;
        self
    }
}

pub fn emit(event: WarnEvent<'_>) {
    tracing::warn!(
        code = %sanitize_value(event.code),
        stage = %sanitize_value(event.stage),
        conversation = %sanitize_value(event.conversation),
        retry = %sanitize_value(event.retry),
        reason = %sanitize_value(event.reason),
        err = %sanitize_value(event.err),
        "COMMSYNC_WARN"
    );
}

//! Placeholder rendering for message templates.

/// Renders a static template, replacing each `{name}` with its variable.
///
/// Rendering is a single left-to-right pass: substituted values are never
/// scanned again, so an error text that happens to contain `{vm}` is
/// printed as is. Placeholders without a variable are kept verbatim.
pub struct MessageBuilder {
    template: &'static str,
    vars: Vec<(&'static str, String)>,
}

impl MessageBuilder {
    pub fn new(template: &'static str) -> Self {
        Self {
            template,
            vars: Vec::new(),
        }
    }

    /// Set `key`; a later value for the same key wins.
    pub fn var(mut self, key: &'static str, value: impl ToString) -> Self {
        let value = value.to_string();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
        self
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn build(self) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find(['{', '}']) else {
                out.push('{');
                rest = after;
                break;
            };
            let key = &after[..close];
            match self.lookup(key) {
                Some(value) if after.as_bytes()[close] == b'}' => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

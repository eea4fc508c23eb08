/// Render a message template: `msg!(MESSAGES.preview_duplicate_name, vm = name)`.
///
/// Each `key = value` fills the `{key}` placeholder; values only need
/// `ToString`.
#[macro_export]
macro_rules! msg {
    ($template:expr $(,)?) => {
        $crate::builder::MessageBuilder::new($template).build()
    };
    ($template:expr, $($key:ident = $value:expr),+ $(,)?) => {
        $crate::builder::MessageBuilder::new($template)
            $(.var(stringify!($key), $value))+
            .build()
    };
}

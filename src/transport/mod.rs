/// Transport framing.
///
/// Transports are pure framing adapters: they parse `{name, arguments}`
/// requests off the wire and hand them to the one dispatcher. No tool logic
/// lives here.
pub mod stdio;

pub use stdio::StdioServer;

//! Session negotiation configuration.
//!
//! [`HandshakeConfig`] describes what the bridge asks the daemon for. It
//! produces the client side instructions of the negotiation; the I/O is
//! driven by [`Stream::handshake`](crate::Stream::handshake).

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use url::form_urlencoded;

use super::{Instruction, PROTOCOL_VERSION};

// ============================================================================
// Constants
// ============================================================================

/// Default display width in pixels.
pub const DEFAULT_WIDTH: u32 = 1024;

/// Default display height in pixels.
pub const DEFAULT_HEIGHT: u32 = 768;

/// Default display resolution in DPI.
pub const DEFAULT_DPI: u32 = 96;

/// Prefix of the protocol version marker the daemon may list in `args`.
const VERSION_PREFIX: &str = "VERSION_";

/// Value substituted for secrets in [`HandshakeConfig::redacted`].
const REDACTED: &str = "********";

/// Parameters never written to logs verbatim.
const SECRET_PARAMETERS: &[&str] = &["password", "passphrase", "private-key"];

// ============================================================================
// HandshakeConfig
// ============================================================================

/// Parameters for opening (or joining) a session on the daemon.
///
/// # Example
///
/// ```
/// use guac_bridge::HandshakeConfig;
///
/// let config = HandshakeConfig::new("vnc")
///     .parameter("hostname", "10.0.0.5")
///     .parameter("port", "5900")
///     .size(1280, 720);
///
/// assert_eq!(config.select_arg(), "vnc");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Protocol for a new session (`vnc`, `rdp`, `ssh`, ...).
    protocol: String,
    /// Existing connection to join instead of creating one.
    connection_id: Option<String>,
    /// Parameter values keyed by the names the daemon asks for.
    parameters: FxHashMap<String, String>,
    width: u32,
    height: u32,
    dpi: u32,
    audio_mimetypes: Vec<String>,
    video_mimetypes: Vec<String>,
    image_mimetypes: Vec<String>,
    timezone: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            connection_id: None,
            parameters: FxHashMap::default(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            dpi: DEFAULT_DPI,
            audio_mimetypes: Vec::new(),
            video_mimetypes: Vec::new(),
            image_mimetypes: Vec::new(),
            timezone: None,
        }
    }
}

// ============================================================================
// HandshakeConfig - Builder
// ============================================================================

impl HandshakeConfig {
    /// Creates a configuration for a new session of `protocol`.
    #[inline]
    #[must_use]
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    /// Creates a configuration joining an existing connection.
    #[inline]
    #[must_use]
    pub fn join(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Self::default()
        }
    }

    /// Sets the connection id to join.
    #[inline]
    #[must_use]
    pub fn connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    /// Sets one parameter value. A later value for the same name wins.
    #[inline]
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Sets the optimal display size.
    #[inline]
    #[must_use]
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Sets the optimal display resolution.
    #[inline]
    #[must_use]
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    /// Sets the supported audio MIME types.
    #[must_use]
    pub fn audio<I, S>(mut self, mimetypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audio_mimetypes = mimetypes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the supported video MIME types.
    #[must_use]
    pub fn video<I, S>(mut self, mimetypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.video_mimetypes = mimetypes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the supported image MIME types.
    #[must_use]
    pub fn image<I, S>(mut self, mimetypes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.image_mimetypes = mimetypes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the client timezone (IANA name).
    #[inline]
    #[must_use]
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

// ============================================================================
// HandshakeConfig - Query Strings
// ============================================================================

impl HandshakeConfig {
    /// Builds a configuration from URL query parameters.
    ///
    /// `scheme` selects the protocol, `uuid` joins an existing connection,
    /// `width`/`height` set the display size (invalid or zero values keep
    /// the defaults). Every pair is also passed through as a parameter; the
    /// first occurrence of a repeated name wins.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut config = Self::default().audio(["audio/L16", "rate=44100", "channels=2"]);

        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            if config.parameters.contains_key(&*name) {
                continue;
            }

            match &*name {
                "scheme" => config.protocol = value.to_string(),
                "uuid" if !value.is_empty() => config.connection_id = Some(value.to_string()),
                "width" => config.width = parse_dimension(&value, DEFAULT_WIDTH),
                "height" => config.height = parse_dimension(&value, DEFAULT_HEIGHT),
                _ => {}
            }

            config
                .parameters
                .insert(name.into_owned(), value.into_owned());
        }

        config
    }

    /// Returns a copy safe for logging, with secret parameters masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for (name, value) in &mut copy.parameters {
            if SECRET_PARAMETERS.contains(&name.as_str()) {
                *value = REDACTED.to_owned();
            }
        }
        copy
    }
}

fn parse_dimension(value: &str, fallback: u32) -> u32 {
    match value.parse::<u32>() {
        Ok(0) | Err(_) => fallback,
        Ok(n) => n,
    }
}

// ============================================================================
// HandshakeConfig - Accessors
// ============================================================================

impl HandshakeConfig {
    /// Returns the protocol name.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the value for a parameter name, if configured.
    #[inline]
    #[must_use]
    pub fn get_parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Returns `(width, height, dpi)`.
    #[inline]
    #[must_use]
    pub fn display(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.dpi)
    }

    /// Returns the argument of the `select` instruction.
    ///
    /// The connection id when joining, otherwise the protocol.
    #[must_use]
    pub fn select_arg(&self) -> &str {
        match &self.connection_id {
            Some(id) if !id.is_empty() => id,
            _ => &self.protocol,
        }
    }
}

// ============================================================================
// HandshakeConfig - Instructions
// ============================================================================

impl HandshakeConfig {
    /// Builds the opening `select` instruction.
    #[must_use]
    pub fn select_instruction(&self) -> Instruction {
        Instruction::new("select", [self.select_arg()])
    }

    /// Returns the `connect` values in the exact order of `requested`.
    ///
    /// Names without a configured value map to an empty string; a leading
    /// `VERSION_x_y_z` marker is answered with our own protocol version.
    #[must_use]
    pub fn connect_args(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .map(|name| {
                if name.starts_with(VERSION_PREFIX) {
                    PROTOCOL_VERSION.to_owned()
                } else {
                    self.parameters.get(name).cloned().unwrap_or_default()
                }
            })
            .collect()
    }

    /// Builds the instructions answering an `args` request, in send order.
    #[must_use]
    pub fn response_instructions(&self, requested: &[String]) -> Vec<Instruction> {
        let mut instructions = vec![
            Instruction::new(
                "size",
                [
                    self.width.to_string(),
                    self.height.to_string(),
                    self.dpi.to_string(),
                ],
            ),
            Instruction::new("audio", self.audio_mimetypes.iter().cloned()),
            Instruction::new("video", self.video_mimetypes.iter().cloned()),
            Instruction::new("image", self.image_mimetypes.iter().cloned()),
        ];

        if let Some(timezone) = &self.timezone {
            instructions.push(Instruction::new("timezone", [timezone.as_str()]));
        }

        instructions.push(Instruction::new("connect", self.connect_args(requested)));
        instructions
    }
}

// ============================================================================
// Tests
// ============================================================================

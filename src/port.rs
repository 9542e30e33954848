//! Typed ports and the messages published on them.
//!
//! A port is a typed endpoint on a node. The port layer rejects
//! connections with mismatched types at wiring time: [`MessageKind`] is
//! checked by [`crate::pipeline::Pipeline::init`] before any node ever runs.

use crate::matrix::Matrix;
use crate::texture::ScratchHandle;
use crate::value::Vector2;

/// Which direction a port faces on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// The declared type of a port, used to reject mismatched connections at
/// wiring time rather than at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Image,
    Keypoint,
    Matrix2D,
    Vector2D,
}

/// A refinement on top of [`MessageKind::Image`], e.g. "image must be
/// greyscale". Checked when a node declares an input expects it; violating
/// it is a [`crate::error::ValidationError::TypeMismatch`] at wiring time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageExpectation {
    Any,
    Greyscale,
}

/// A typed endpoint on a node.
///
/// Invariant: every input port is connected to exactly one output port
/// before execution; an output port may fan out to many inputs. This
/// struct only records a port's own declaration; connection bookkeeping
/// lives in [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub name: String,
    pub direction: PortDirection,
    pub kind: MessageKind,
    pub image_expectation: Option<ImageExpectation>,
}

impl PortSpec {
    pub fn input(name: &str, kind: MessageKind) -> Self {
        PortSpec {
            name: name.to_string(),
            direction: PortDirection::Input,
            kind,
            image_expectation: None,
        }
    }

    pub fn output(name: &str, kind: MessageKind) -> Self {
        PortSpec {
            name: name.to_string(),
            direction: PortDirection::Output,
            kind,
            image_expectation: None,
        }
    }

    pub fn expect_greyscale(mut self) -> Self {
        self.image_expectation = Some(ImageExpectation::Greyscale);
        self
    }

    /// Mark an *output* port as statically known to always publish a
    /// greyscale image (e.g. a source configured with `greyscale: true`).
    /// Reuses the same field an input port uses for its requirement: on an
    /// output it reads as a guarantee instead.
    pub fn guarantees_greyscale(mut self) -> Self {
        self.image_expectation = Some(ImageExpectation::Greyscale);
        self
    }

    /// Whether a connection from `upstream` (an output port) may feed this
    /// port, checked at wiring time rather than at run time.
    pub fn accepts(&self, upstream: &PortSpec) -> bool {
        if self.kind != upstream.kind {
            return false;
        }
        match self.image_expectation {
            Some(ImageExpectation::Greyscale) => {
                matches!(upstream.image_expectation, Some(ImageExpectation::Greyscale))
            }
            Some(ImageExpectation::Any) | None => true,
        }
    }
}

/// An immutable value published by a node on an output port.
///
/// Invariant: a message's resources (textures) remain valid at
/// least until every downstream node scheduled in the same run has consumed
/// it; the scheduler, not the message, enforces this by deferring
/// [`crate::texture::TexturePool::release_scratch`] until after the last
/// consumer runs.
#[derive(Debug, Clone)]
pub enum Message {
    Image {
        texture: ScratchHandle,
        greyscale: bool,
    },
    Keypoint {
        encoded_keypoints: ScratchHandle,
        descriptor_size: usize,
        extra_size: usize,
        encoder_length: u32,
    },
    Matrix2D(Matrix),
    Vector2D(Vector2),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Image { .. } => MessageKind::Image,
            Message::Keypoint { .. } => MessageKind::Keypoint,
            Message::Matrix2D(_) => MessageKind::Matrix2D,
            Message::Vector2D(_) => MessageKind::Vector2D,
        }
    }

    pub fn is_greyscale(&self) -> bool {
        matches!(self, Message::Image { greyscale: true, .. })
    }

    /// The texture this message references, if any, so the scheduler can
    /// account for its lifetime in the texture pool.
    pub fn texture_handle(&self) -> Option<ScratchHandle> {
        match self {
            Message::Image { texture, .. } => Some(*texture),
            Message::Keypoint {
                encoded_keypoints, ..
            } => Some(*encoded_keypoints),
            Message::Matrix2D(_) | Message::Vector2D(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_kinds_never_connect() {
        let image_out = PortSpec::output("o", MessageKind::Image);
        let keypoint_in = PortSpec::input("i", MessageKind::Keypoint);
        assert!(!keypoint_in.accepts(&image_out));
    }

    #[test]
    fn plain_image_input_accepts_any_image_output() {
        let color_out = PortSpec::output("o", MessageKind::Image);
        let grey_out = PortSpec::output("o", MessageKind::Image).guarantees_greyscale();
        let plain_in = PortSpec::input("i", MessageKind::Image);
        assert!(plain_in.accepts(&color_out));
        assert!(plain_in.accepts(&grey_out));
    }

    #[test]
    fn greyscale_input_rejects_color_output_and_accepts_greyscale() {
        let color_out = PortSpec::output("o", MessageKind::Image);
        let grey_out = PortSpec::output("o", MessageKind::Image).guarantees_greyscale();
        let grey_in = PortSpec::input("i", MessageKind::Image).expect_greyscale();
        assert!(!grey_in.accepts(&color_out));
        assert!(grey_in.accepts(&grey_out));
    }

    #[test]
    fn message_kind_and_texture_handle_roundtrip() {
        let msg = Message::Vector2D(Vector2::new(1.0, 2.0));
        assert_eq!(msg.kind(), MessageKind::Vector2D);
        assert!(msg.texture_handle().is_none());
        assert!(!msg.is_greyscale());
    }
}

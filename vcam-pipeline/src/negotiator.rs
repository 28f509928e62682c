//! Input/output format negotiation
//!
//! Conversion flags are computed here once per format change; the submitter
//! only ever reads the cached result.

use crate::error::{Result, VcamError};
use crate::types::{FormatDescriptor, SupportedFormats};

/// Which conversion stages a frame has to go through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionFlags {
    pub pixel: bool,
    pub resolution: bool,
}

impl ConversionFlags {
    pub fn between(input: &FormatDescriptor, output: &FormatDescriptor) -> Self {
        Self {
            pixel: input.pixel_format != output.pixel_format,
            resolution: !input.same_resolution(output),
        }
    }

    pub fn any(self) -> bool {
        self.pixel || self.resolution
    }
}

/// Formats in effect, copied out for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub input: FormatDescriptor,
    pub output: FormatDescriptor,
    pub flags: ConversionFlags,
    /// Bumped on every successful negotiation
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    supported: SupportedFormats,
    current: Negotiated,
}

impl FormatNegotiator {
    pub fn new(
        supported: SupportedFormats,
        input: FormatDescriptor,
        output: FormatDescriptor,
    ) -> Result<Self> {
        check(&supported, &input, &output)?;
        Ok(Self {
            supported,
            current: Negotiated {
                input,
                output,
                flags: ConversionFlags::between(&input, &output),
                generation: 0,
            },
        })
    }

    /// Replace both formats; on failure the previous pair stays in effect
    pub fn negotiate(
        &mut self,
        input: FormatDescriptor,
        output: FormatDescriptor,
    ) -> Result<ConversionFlags> {
        check(&self.supported, &input, &output)?;

        let flags = ConversionFlags::between(&input, &output);
        self.current = Negotiated {
            input,
            output,
            flags,
            generation: self.current.generation + 1,
        };
        log::debug!(
            "negotiated {} -> {} (pixel conversion: {}, scaling: {})",
            input,
            output,
            flags.pixel,
            flags.resolution
        );
        Ok(flags)
    }

    pub fn set_input(&mut self, input: FormatDescriptor) -> Result<ConversionFlags> {
        self.negotiate(input, self.current.output)
    }

    pub fn set_output(&mut self, output: FormatDescriptor) -> Result<ConversionFlags> {
        self.negotiate(self.current.input, output)
    }

    pub fn input(&self) -> FormatDescriptor {
        self.current.input
    }

    pub fn output(&self) -> FormatDescriptor {
        self.current.output
    }

    pub fn flags(&self) -> ConversionFlags {
        self.current.flags
    }

    pub fn supported(&self) -> &SupportedFormats {
        &self.supported
    }

    pub fn snapshot(&self) -> Negotiated {
        self.current
    }
}

fn check(
    supported: &SupportedFormats,
    input: &FormatDescriptor,
    output: &FormatDescriptor,
) -> Result<()> {
    if !supported.contains(output.pixel_format) {
        return Err(VcamError::UnsupportedFormat(format!(
            "{} is not an advertised output format",
            output.pixel_format
        )));
    }
    input.validate()?;
    output.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;

    fn negotiator() -> FormatNegotiator {
        let supported = SupportedFormats::new(&[PixelFormat::Rgb24, PixelFormat::Yuyv]).unwrap();
        let desc = FormatDescriptor::new(PixelFormat::Rgb24, 640, 480);
        FormatNegotiator::new(supported, desc, desc).unwrap()
    }

    #[test]
    fn test_identity_needs_no_conversion() {
        let negotiator = negotiator();
        assert_eq!(negotiator.flags(), ConversionFlags::default());
        assert!(!negotiator.flags().any());
    }

    #[test]
    fn test_flags_are_independent() {
        let mut negotiator = negotiator();
        let input = FormatDescriptor::new(PixelFormat::Rgb24, 640, 480);

        let flags = negotiator
            .negotiate(input, FormatDescriptor::new(PixelFormat::Yuyv, 640, 480))
            .unwrap();
        assert_eq!(flags, ConversionFlags { pixel: true, resolution: false });

        let flags = negotiator
            .negotiate(input, FormatDescriptor::new(PixelFormat::Rgb24, 320, 240))
            .unwrap();
        assert_eq!(flags, ConversionFlags { pixel: false, resolution: true });

        let flags = negotiator
            .set_output(FormatDescriptor::new(PixelFormat::Yuyv, 320, 240))
            .unwrap();
        assert_eq!(flags, ConversionFlags { pixel: true, resolution: true });
        assert_eq!(negotiator.snapshot().generation, 3);
    }

    #[test]
    fn test_unsupported_output_keeps_previous_state() {
        let mut negotiator = negotiator();
        let before = negotiator.snapshot();

        let result = negotiator.set_output(FormatDescriptor::new(PixelFormat::Nv12, 640, 480));
        assert!(matches!(result, Err(VcamError::UnsupportedFormat(_))));
        assert_eq!(negotiator.snapshot(), before);
    }

    #[test]
    fn test_unrepresentable_geometry_rejected() {
        let mut negotiator = negotiator();
        let before = negotiator.snapshot();

        assert!(negotiator
            .set_output(FormatDescriptor::new(PixelFormat::Yuyv, 641, 480))
            .is_err());
        assert!(negotiator
            .set_input(FormatDescriptor::new(PixelFormat::Rgb24, 0, 480))
            .is_err());
        assert_eq!(negotiator.snapshot(), before);
    }

    #[test]
    fn test_input_format_is_not_restricted() {
        let mut negotiator = negotiator();
        let flags = negotiator
            .set_input(FormatDescriptor::new(PixelFormat::Uyvy, 640, 480))
            .unwrap();
        assert!(flags.pixel);
        assert_eq!(negotiator.input().pixel_format, PixelFormat::Uyvy);
    }
}

//! Browser identity descriptors.
//!
//! Every session is opened with a descriptor (user-agent class, viewport,
//! locale, timezone). The default source round-robins over a small table of
//! plausible desktop/mobile profiles and jitters the viewport so consecutive
//! sessions never present pixel-identical windows.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAgentClass {
    DesktopChrome,
    DesktopEdge,
    DesktopFirefox,
    MacSafari,
    MobileChrome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDescriptor {
    pub user_agent_class: UserAgentClass,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
}

/// Source of per-session identity descriptors.
pub trait DescriptorSource: Send + Sync {
    fn next_descriptor(&self) -> IdentityDescriptor;
}

struct Template {
    user_agent_class: UserAgentClass,
    viewport: (u32, u32),
    locale: &'static str,
    timezone: &'static str,
}

const TEMPLATES: &[Template] = &[
    Template {
        user_agent_class: UserAgentClass::DesktopChrome,
        viewport: (1920, 1080),
        locale: "en-US",
        timezone: "America/New_York",
    },
    Template {
        user_agent_class: UserAgentClass::DesktopEdge,
        viewport: (1536, 864),
        locale: "en-GB",
        timezone: "Europe/London",
    },
    Template {
        user_agent_class: UserAgentClass::DesktopFirefox,
        viewport: (1440, 900),
        locale: "en-US",
        timezone: "America/Chicago",
    },
    Template {
        user_agent_class: UserAgentClass::MacSafari,
        viewport: (1680, 1050),
        locale: "en-US",
        timezone: "America/Los_Angeles",
    },
    Template {
        user_agent_class: UserAgentClass::DesktopChrome,
        viewport: (1366, 768),
        locale: "en-SG",
        timezone: "Asia/Singapore",
    },
    Template {
        user_agent_class: UserAgentClass::MobileChrome,
        viewport: (412, 915),
        locale: "en-US",
        timezone: "America/Denver",
    },
];

const VIEWPORT_JITTER: i64 = 16;

/// Round-robin descriptor table with viewport jitter.
#[derive(Debug, Default)]
pub struct RotatingDescriptors {
    cursor: AtomicUsize,
}

impl RotatingDescriptors {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorSource for RotatingDescriptors {
    fn next_descriptor(&self) -> IdentityDescriptor {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % TEMPLATES.len();
        let template = &TEMPLATES[index];
        let mut rng = rand::thread_rng();
        let jitter = |base: u32, rng: &mut rand::rngs::ThreadRng| {
            let offset = rng.gen_range(-VIEWPORT_JITTER..=VIEWPORT_JITTER);
            (i64::from(base) + offset).max(320) as u32
        };

        IdentityDescriptor {
            user_agent_class: template.user_agent_class,
            viewport: Viewport {
                width: jitter(template.viewport.0, &mut rng),
                height: jitter(template.viewport.1, &mut rng),
            },
            locale: template.locale.to_string(),
            timezone: template.timezone.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_templates() {
        let source = RotatingDescriptors::new();
        let first: Vec<_> = (0..TEMPLATES.len())
            .map(|_| source.next_descriptor().timezone)
            .collect();
        let second: Vec<_> = (0..TEMPLATES.len())
            .map(|_| source.next_descriptor().timezone)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first[0], "America/New_York");
    }

    #[test]
    fn viewport_jitter_is_bounded() {
        let source = RotatingDescriptors::new();
        let descriptor = source.next_descriptor();
        let width = i64::from(descriptor.viewport.width);
        assert!((width - 1920).abs() <= VIEWPORT_JITTER);
    }
}

//! Human-like page interaction.

use rand::Rng;

use crate::config::ScrollConfig;
use crate::modules::identity::Viewport;

use super::{Session, SessionError};

/// Moves the pointer to a random point inside the central area of the viewport.
pub async fn wander_pointer(session: &dyn Session, viewport: Viewport) -> Result<(), SessionError> {
    let (x, y) = {
        let mut rng = rand::thread_rng();
        let width = f64::from(viewport.width.max(1));
        let height = f64::from(viewport.height.max(1));
        (
            rng.gen_range(width * 0.2..=width * 0.8),
            rng.gen_range(height * 0.2..=height * 0.8),
        )
    };
    session.move_pointer(x, y).await
}

/// Scrolls in fixed steps until the covered distance reaches the page's
/// scroll height, re-reading the height each step so lazily loaded content
/// extends the loop. Returns the number of steps taken.
pub async fn auto_scroll(session: &dyn Session, config: &ScrollConfig) -> Result<u32, SessionError> {
    let step = config.step_px.max(1);
    let mut covered = 0u64;
    let mut steps = 0u32;

    loop {
        let height = session.scroll_height().await?;
        if covered >= height || steps >= config.max_steps {
            break;
        }
        session.scroll_by(step).await?;
        covered += step;
        steps += 1;
        config.interval.pause().await;
    }

    log::debug!("auto-scroll covered {covered}px in {steps} steps");
    Ok(steps)
}

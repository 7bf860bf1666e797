// Terminal display: one indicatif bar per indicator

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{ProgressEvent, ProgressRegistry};

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:40!} [{bar:30.cyan/blue}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Follow the registry's events until it goes away, drawing to stderr.
pub fn spawn_terminal_display(registry: &ProgressRegistry) -> JoinHandle<()> {
    let mut rx = registry.subscribe();
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let mut bars: HashMap<String, ProgressBar> = HashMap::new();

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("[Display] skipped {} progress events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                ProgressEvent::Spawned { id, label } => {
                    let bar = multi.add(ProgressBar::new(100));
                    bar.set_style(bar_style());
                    bar.set_message(label);
                    bars.insert(id, bar);
                }
                ProgressEvent::Updated { id, percent } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.set_position(percent as u64);
                    }
                }
                ProgressEvent::Failed { id, message } => {
                    if let Some(bar) = bars.get(&id) {
                        bar.abandon_with_message(format!("failed: {}", message));
                    }
                }
                ProgressEvent::Fading { id, .. } => {
                    if let Some(bar) = bars.get(&id) {
                        if !bar.is_finished() {
                            bar.finish();
                        }
                    }
                }
                ProgressEvent::Removed { id } => {
                    if let Some(bar) = bars.remove(&id) {
                        multi.remove(&bar);
                    }
                }
                ProgressEvent::ContainerShown | ProgressEvent::ContainerHidden => {}
            }
        }

        for bar in bars.values() {
            bar.abandon();
        }
    })
}

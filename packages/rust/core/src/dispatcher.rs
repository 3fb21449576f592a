//! Price movement messages.

use tracing::{info, instrument};

use pricewatch_notify::NotificationChannel;
use pricewatch_shared::{Result, TrackedItem};

use crate::detector::{Direction, PriceMovement};

/// Formats [`PriceMovement`]s and hands them to a [`NotificationChannel`].
pub struct NotificationDispatcher<'a, C: NotificationChannel> {
    channel: &'a C,
    currency: String,
}

impl<'a, C: NotificationChannel> NotificationDispatcher<'a, C> {
    pub fn new(channel: &'a C, currency: impl Into<String>) -> Self {
        Self {
            channel,
            currency: currency.into(),
        }
    }

    /// Send one movement. The caller decides what a failure means; nothing is retried.
    #[instrument(skip_all, fields(item_id = item.item_id))]
    pub async fn dispatch(&self, item: &TrackedItem, movement: &PriceMovement) -> Result<()> {
        let message = format_message(item, movement, &self.currency);
        self.channel.send(&message).await?;
        info!(
            brand = %item.brand_name,
            item = %item.name,
            classification = movement.insight.classification.label(),
            "price movement notified"
        );
        Ok(())
    }
}

/// Render a movement as a Telegram-flavoured HTML message.
pub fn format_message(item: &TrackedItem, movement: &PriceMovement, currency: &str) -> String {
    let arrow = match movement.direction {
        Direction::Down => "↓",
        Direction::Up => "↑",
    };
    let percent = movement
        .percent_change
        .map(|p| format!("{p:.1}%"))
        .unwrap_or_else(|| "n/a".into());

    let mut msg = String::new();
    msg.push_str("<b>PRICE MOVEMENT DETECTED</b>\n\n");
    msg.push_str(&format!("<b>{}</b>\n", escape_html(&item.brand_name)));
    msg.push_str(&format!("{}\n", escape_html(&item.name)));
    msg.push_str(&format!(
        "Old: {} {currency}\n",
        format_amount(movement.previous, 0)
    ));
    msg.push_str(&format!(
        "New: <b>{} {currency}</b> ({arrow} {percent})\n",
        format_amount(movement.current, 0)
    ));
    msg.push_str("---------------------------\n");
    msg.push_str(&format!(
        "<b>Insight:</b> {}\n",
        movement.insight.classification.label()
    ));
    if let Some(z) = movement.insight.z_score {
        msg.push_str(&format!("<b>Z-score:</b> {z:.2} (vs history)\n"));
    }
    msg.push_str("---------------------------\n");
    msg.push_str(&format!(
        "<a href=\"{}\">View item</a>",
        escape_html(&item.url)
    ));
    msg
}

/// Format with `decimals` places and comma thousands separators.
pub fn format_amount(amount: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, amount.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (formatted.as_str(), None),
    };

    let mut out = String::with_capacity(formatted.len() + int_part.len() / 3 + 1);
    if amount < 0.0 {
        out.push('-');
    }
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if let Some(frac) = frac_part {
        out.push('.');
        out.push_str(frac);
    }
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

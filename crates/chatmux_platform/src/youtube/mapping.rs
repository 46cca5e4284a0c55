#![forbid(unsafe_code)]

use chatmux_domain::{Badges, ChatMessage, MessageKind, Platform};

use super::client::LiveChatItem;

fn non_blank(s: Option<&str>) -> Option<&str> {
	s.map(str::trim).filter(|s| !s.is_empty())
}

fn micros_to_amount(micros: Option<u64>) -> Option<f64> {
	micros.map(|m| m as f64 / 1_000_000.0)
}

/// Normalize one `liveChatMessages` item. Moderation and system events yield `None`.
pub fn message_from_item(item: &LiveChatItem) -> Option<ChatMessage> {
	let snippet = &item.snippet;
	let author = item.author_details.as_ref()?;
	let username = non_blank(Some(author.display_name.as_str())).or(non_blank(Some(author.channel_id.as_str())))?;
	let display = non_blank(snippet.display_message.as_deref());

	let mut donation: Option<(f64, String)> = None;
	let mut extra: Vec<(&'static str, String)> = Vec::new();

	let (kind, text) = match snippet.kind.as_str() {
		"textMessageEvent" => {
			let text = snippet
				.text_message_details
				.as_ref()
				.map(|t| t.message_text.as_str())
				.filter(|t| !t.trim().is_empty())
				.or(display)?;
			(MessageKind::Normal, text.to_string())
		}
		"superChatEvent" => {
			let d = snippet.super_chat_details.as_ref()?;
			if let Some(amount) = micros_to_amount(d.amount_micros) {
				donation = Some((amount, d.currency.clone().unwrap_or_default()));
			}
			if let Some(tier) = d.tier {
				extra.push(("tier", tier.to_string()));
			}
			let text = non_blank(d.user_comment.as_deref())
				.or(display)
				.or(non_blank(d.amount_display_string.as_deref()))
				.unwrap_or_default();
			(MessageKind::PaidMessage, text.to_string())
		}
		"superStickerEvent" => {
			let d = snippet.super_sticker_details.as_ref()?;
			if let Some(amount) = micros_to_amount(d.amount_micros) {
				donation = Some((amount, d.currency.clone().unwrap_or_default()));
			}
			let alt = d.super_sticker_metadata.as_ref().and_then(|m| non_blank(m.alt_text.as_deref()));
			if let Some(alt) = alt {
				extra.push(("sticker", alt.to_string()));
			}
			let text = alt
				.or(display)
				.or(non_blank(d.amount_display_string.as_deref()))
				.unwrap_or_default();
			(MessageKind::PaidMessage, text.to_string())
		}
		"newSponsorEvent" => {
			if let Some(level) = snippet.new_sponsor_details.as_ref().and_then(|d| d.member_level_name.clone()) {
				extra.push(("member_level", level));
			}
			(MessageKind::Membership, display.unwrap_or_default().to_string())
		}
		"memberMilestoneChatEvent" => {
			let d = snippet.member_milestone_chat_details.as_ref();
			if let Some(months) = d.and_then(|d| d.member_month) {
				extra.push(("months", months.to_string()));
			}
			if let Some(level) = d.and_then(|d| d.member_level_name.clone()) {
				extra.push(("member_level", level));
			}
			let text = d.and_then(|d| non_blank(d.user_comment.as_deref())).or(display);
			(MessageKind::Membership, text.unwrap_or_default().to_string())
		}
		"giftMembershipReceivedEvent" => {
			if let Some(level) = snippet
				.gift_membership_received_details
				.as_ref()
				.and_then(|d| d.member_level_name.clone())
			{
				extra.push(("member_level", level));
			}
			(MessageKind::Membership, display.unwrap_or_default().to_string())
		}
		"membershipGiftingEvent" => {
			let d = snippet.membership_gifting_details.as_ref();
			if let Some(count) = d.and_then(|d| d.gift_memberships_count) {
				extra.push(("gift_count", count.to_string()));
			}
			if let Some(level) = d.and_then(|d| d.gift_memberships_level_name.clone()) {
				extra.push(("member_level", level));
			}
			(MessageKind::Gift, display.unwrap_or_default().to_string())
		}
		_ => return None,
	};

	let mut msg = ChatMessage::new(Platform::YouTube, username, text)
		.with_display_name(author.display_name.as_str())
		.with_kind(kind)
		.with_avatar_url(author.profile_image_url.clone())
		.with_badges(Badges {
			is_moderator: author.is_chat_moderator,
			is_owner: author.is_chat_owner,
			is_subscriber: author.is_chat_sponsor,
			is_verified: author.is_verified,
		})
		.with_metadata("message_id", item.id.as_str())
		.with_metadata("event_type", snippet.kind.as_str());

	if let Some(ts) = snippet.published_at {
		msg = msg.with_timestamp(ts);
	}
	if !author.channel_id.is_empty() {
		msg = msg.with_metadata("author_channel_id", author.channel_id.as_str());
	}
	if let Some((amount, currency)) = donation {
		msg = msg.with_donation(amount, currency);
	}
	for (key, value) in extra {
		msg = msg.with_metadata(key, value);
	}
	Some(msg)
}

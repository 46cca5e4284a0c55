#![forbid(unsafe_code)]

use super::profile::ScrapeProfile;

/// Host function the page posts JSON strings through.
pub const DEFAULT_POST_EXPRESSION: &str = "window.ipc.postMessage";

/// Evaluates to `true` while an observer is installed in the page.
pub const HEALTH_CHECK_SCRIPT: &str =
	"(typeof window.__chatmuxObserver === 'object' && window.__chatmuxObserver !== null)";

pub const TEARDOWN_SCRIPT: &str = "(window.__chatmuxObserver && window.__chatmuxObserver.stop(), true)";

const OBSERVER_TEMPLATE: &str = r#"(function () {
	const post = (payload) => {
		try { __POST__(JSON.stringify(payload)); } catch (e) {}
	};
	if (window.__chatmuxObserver) {
		post({ type: 'initialized', selector: window.__chatmuxObserver.selector });
		return 'reused';
	}
	const cfg = __CONFIG__;
	const seen = new Set();
	const state = { selector: null };

	const firstText = (node, selectors) => {
		for (const s of selectors) {
			const el = node.querySelector(s);
			const text = el && el.textContent ? el.textContent.trim() : '';
			if (text) return text;
		}
		return '';
	};

	const rows = () => {
		let nodes = document.querySelectorAll(cfg.item_selector);
		if (nodes.length) return { selector: cfg.item_selector, nodes };
		for (const s of cfg.fallback_selectors) {
			nodes = document.querySelectorAll(s);
			if (nodes.length) return { selector: s, nodes };
		}
		return { selector: null, nodes: [] };
	};

	const toItem = (node) => {
		const author = firstText(node, cfg.author_selectors);
		if (!author) return null;
		const item = { author, text: firstText(node, cfg.text_selectors) };
		const nodeId = node.getAttribute('data-id') || node.getAttribute('data-message-id') || node.id;
		if (nodeId) item.id = nodeId;
		if (cfg.avatar_selector) {
			const img = node.querySelector(cfg.avatar_selector);
			if (img && img.src) item.avatar = img.src;
		}
		if (cfg.gift_selector && (node.matches(cfg.gift_selector) || node.querySelector(cfg.gift_selector))) {
			item.gift = true;
			if (cfg.gift_name_selector) {
				const name = firstText(node, [cfg.gift_name_selector]);
				if (name) item.gift_name = name;
			}
			if (cfg.gift_count_selector) {
				const count = parseInt(firstText(node, [cfg.gift_count_selector]).replace(/[^0-9]/g, ''), 10);
				if (Number.isFinite(count)) item.gift_count = count;
			}
		}
		return item;
	};

	const scan = () => {
		const found = rows();
		state.selector = found.selector;
		const batch = [];
		for (const node of found.nodes) {
			if (node.dataset && node.dataset.chatmuxSeen) continue;
			const item = toItem(node);
			if (!item) continue;
			if (node.dataset) node.dataset.chatmuxSeen = '1';
			const key = item.id || item.author + '|' + item.text;
			if (seen.has(key)) continue;
			if (seen.size >= cfg.seen_limit) seen.clear();
			seen.add(key);
			batch.push(item);
		}
		if (batch.length === 1) post({ type: 'comment', item: batch[0] });
		else if (batch.length > 1) post({ type: 'batch', items: batch });
	};

	const safeScan = () => {
		try { scan(); } catch (e) { post({ type: 'error', message: String(e && e.message || e) }); }
	};

	let queued = false;
	const observer = new MutationObserver(() => {
		if (queued) return;
		queued = true;
		setTimeout(() => { queued = false; safeScan(); }, 100);
	});
	observer.observe(document.body || document.documentElement, { childList: true, subtree: true });
	const timer = setInterval(safeScan, cfg.rescan_interval_ms);

	state.stop = () => {
		observer.disconnect();
		clearInterval(timer);
		delete window.__chatmuxObserver;
	};
	window.__chatmuxObserver = state;
	safeScan();
	post({ type: 'initialized', selector: state.selector });
	return 'injected';
})()"#;

/// Render the in-page observer for `profile`. Re-evaluating it in a page that
/// already has an observer only re-announces `initialized`.
pub fn observer_script(profile: &ScrapeProfile, post_expression: &str) -> serde_json::Result<String> {
	let config = serde_json::to_string(profile)?;
	Ok(OBSERVER_TEMPLATE
		.replace("__POST__", post_expression)
		.replace("__CONFIG__", &config))
}

/// Interpret the host's rendering of [`HEALTH_CHECK_SCRIPT`].
pub fn observer_alive(result: &str) -> bool {
	result.trim().trim_matches('"').eq_ignore_ascii_case("true")
}

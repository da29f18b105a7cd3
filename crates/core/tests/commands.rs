//! Command surface through the public request path: navigation policy,
//! wait polling, snapshot limits, debugger-forwarded calls, and the
//! validation failures each layer reports.

mod support;

use serde_json::json;

use support::{
	default_engine, engine_with, error_code, error_details, error_retryable, launch, open_page,
	request, response_payload,
};
use tabops_core::{GovernorPolicy, Limits};

#[tokio::test(start_paused = true)]
async fn navigate_updates_target_url() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.navigate",
		json!({ "url": "https://example.com/docs" }),
	)
	.await;
	let payload = response_payload(&envelopes);
	assert_eq!(payload["url"], json!("https://example.com/docs"));
	assert_eq!(payload["settled"], json!(true));

	let sends = world.debug.sends.lock().clone();
	assert!(sends.iter().any(|(target, method, params)| {
		*target == launched.target_id
			&& method == "Page.navigate"
			&& params["url"] == json!("https://example.com/docs")
	}));

	let targets = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"targets.list",
		json!({}),
	)
	.await;
	let listed = response_payload(&targets);
	assert_eq!(listed["targets"][0]["url"], json!("https://example.com/docs"));
}

#[tokio::test(start_paused = true)]
async fn navigate_rejects_disallowed_urls() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	for url in ["file:///etc/passwd", "chrome://settings", "javascript:alert(1)"] {
		let envelopes = request(
			&engine,
			"client-a",
			Some(&launched.session_id),
			Some(&launched.lease_id),
			"page.navigate",
			json!({ "url": url }),
		)
		.await;
		assert_eq!(error_code(&envelopes), "restricted_url");
	}
	assert!(world.debug.sends.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn navigate_times_out_when_page_never_settles() {
	let (engine, world) = default_engine();
	*world.tabs.settles.lock() = false;
	let launched = launch(&engine, "client-a").await;

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.navigate",
		json!({ "url": "https://example.com", "timeoutMs": 2_000 }),
	)
	.await;
	assert_eq!(error_code(&envelopes), "timeout");
	assert!(error_retryable(&envelopes));
}

#[tokio::test(start_paused = true)]
async fn wait_for_polls_until_visible() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;
	world.dom.script_element_states(vec![
		tabops_core::drivers::ElementState { attached: true, visible: false },
		tabops_core::drivers::ElementState { attached: true, visible: false },
		tabops_core::drivers::ElementState { attached: true, visible: true },
	]);

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.waitFor",
		json!({ "selector": "#late" }),
	)
	.await;
	assert_eq!(response_payload(&envelopes)["satisfied"], json!(true));
}

#[tokio::test(start_paused = true)]
async fn wait_for_times_out_on_hidden_element() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;
	world.dom.script_element_states(vec![tabops_core::drivers::ElementState {
		attached: true,
		visible: false,
	}]);

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.waitFor",
		json!({ "selector": "#never", "timeoutMs": 250 }),
	)
	.await;
	assert_eq!(error_code(&envelopes), "timeout");
}

#[tokio::test(start_paused = true)]
async fn snapshot_returns_lines_and_refs() {
	let (engine, _world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.snapshot",
		json!({}),
	)
	.await;
	let payload = response_payload(&envelopes);
	assert_eq!(payload["lines"][0], json!("- button \"Go\" [ref=e1]"));
	assert_eq!(payload["refs"]["e1"], json!("#go"));
}

#[tokio::test(start_paused = true)]
async fn oversized_snapshot_is_rejected() {
	let limits = Limits {
		max_snapshot_bytes: 64,
		..Limits::default()
	};
	let (engine, world) = engine_with(GovernorPolicy::default(), limits);
	let launched = launch(&engine, "client-a").await;
	world
		.snapshots
		.set_lines(vec![format!("- text \"{}\"", "y".repeat(200))]);

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.snapshot",
		json!({}),
	)
	.await;
	assert_eq!(error_code(&envelopes), "snapshot_too_large");
	assert_eq!(error_details(&envelopes)["limitBytes"], json!(64));
}

#[tokio::test(start_paused = true)]
async fn screenshot_forwards_capture_params() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;
	world
		.debug
		.responses
		.lock()
		.insert("Page.captureScreenshot".to_string(), json!({ "data": "aGk=" }));

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.screenshot",
		json!({ "fullPage": true }),
	)
	.await;
	assert_eq!(response_payload(&envelopes)["data"], json!("aGk="));

	let sends = world.debug.sends.lock().clone();
	let (_, _, params) = sends
		.iter()
		.find(|(_, method, _)| method == "Page.captureScreenshot")
		.expect("capture call");
	assert_eq!(params["format"], json!("png"));
	assert_eq!(params["captureBeyondViewport"], json!(true));
}

#[tokio::test(start_paused = true)]
async fn cookies_round_trip_through_debugger() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	let set = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"cookies.set",
		json!({ "cookies": [
			{ "name": "sid", "value": "abc", "domain": "example.com" },
			{ "name": "theme", "value": "dark" },
		] }),
	)
	.await;
	assert_eq!(response_payload(&set)["set"], json!(2));

	request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"cookies.get",
		json!({ "urls": ["https://example.com"] }),
	)
	.await;

	let sends = world.debug.sends.lock().clone();
	assert!(sends.iter().any(|(_, method, params)| {
		method == "Network.setCookies" && params["cookies"][0]["name"] == json!("sid")
	}));
	assert!(sends.iter().any(|(_, method, params)| {
		method == "Network.getCookies" && params["urls"][0] == json!("https://example.com")
	}));
}

#[tokio::test(start_paused = true)]
async fn dom_interactions_reach_the_driver() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	let calls = [
		("dom.press", json!({ "selector": "#field", "key": "Enter" })),
		("dom.check", json!({ "selector": "#opt" })),
		("dom.type", json!({ "selector": "#field", "text": "hi" })),
		("dom.select", json!({ "selector": "#menu", "value": "b" })),
		("dom.scroll", json!({ "dx": 0.0, "dy": 120.0 })),
		("dom.scrollIntoView", json!({ "selector": "#footer" })),
	];
	for (command, payload) in calls {
		let envelopes = request(
			&engine,
			"client-a",
			Some(&launched.session_id),
			Some(&launched.lease_id),
			command,
			payload,
		)
		.await;
		assert!(
			matches!(envelopes.first(), Some(tabops_protocol::Envelope::Response { .. })),
			"{command} failed: {envelopes:?}"
		);
	}

	assert_eq!(
		*world.dom.started.lock(),
		vec![
			"press:#field:Enter",
			"check:#opt:true",
			"type:#field:hi",
			"select:#menu:b",
			"scroll:0:120",
			"scroll_into_view:#footer",
		]
	);
}

#[tokio::test(start_paused = true)]
async fn dom_reads_return_values() {
	let (engine, _world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	let text = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"dom.text",
		json!({ "selector": "#title" }),
	)
	.await;
	assert_eq!(response_payload(&text)["value"], json!("#title content"));

	let visible = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"dom.visible",
		json!({ "selector": "#title" }),
	)
	.await;
	assert_eq!(response_payload(&visible)["value"], json!(true));

	let attr = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"dom.attr",
		json!({ "selector": "a.docs", "name": "href" }),
	)
	.await;
	assert_eq!(response_payload(&attr)["value"], json!("attr:href"));
}

#[tokio::test(start_paused = true)]
async fn named_pages_open_list_and_close() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;
	open_page(&engine, "client-a", &launched, "beta").await;
	open_page(&engine, "client-a", &launched, "alpha").await;

	let duplicate = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.open",
		json!({ "name": "alpha" }),
	)
	.await;
	assert_eq!(error_code(&duplicate), "invalid_request");

	let list = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.list",
		json!({}),
	)
	.await;
	let pages = response_payload(&list);
	assert_eq!(pages["pages"][0]["name"], json!("alpha"));
	assert_eq!(pages["pages"][1]["name"], json!("beta"));

	let close = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.close",
		json!({ "name": "beta" }),
	)
	.await;
	assert_eq!(response_payload(&close)["closed"], json!("beta"));
	assert!(!world.tabs.closed.lock().is_empty());
	assert!(world.sink.take().is_empty());

	let status = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"session.status",
		json!({}),
	)
	.await;
	assert_eq!(response_payload(&status)["targetCount"], json!(2));
}

#[tokio::test(start_paused = true)]
async fn activate_switches_active_target() {
	let (engine, world) = default_engine();
	let launched = launch(&engine, "client-a").await;
	let aux = open_page(&engine, "client-a", &launched, "aux").await;

	let envelopes = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"target.activate",
		json!({ "targetId": aux }),
	)
	.await;
	assert_eq!(response_payload(&envelopes)["activeTargetId"], json!(aux));
	assert_eq!(*world.tabs.activated.lock(), vec!["tab-2".to_string()]);

	// Target-scoped commands without an explicit target now hit the new one.
	request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"dom.click",
		json!({ "selector": "#here" }),
	)
	.await;
	let sends = world.dom.started.lock().clone();
	assert_eq!(sends, vec!["click:#here".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn attach_failure_maps_to_cdp_attach_failed() {
	let (engine, world) = default_engine();
	*world.debug.attach_error.lock() = Some("no debugger endpoint".to_string());

	let envelopes = request(&engine, "client-a", None, None, "browser.launch", json!({})).await;
	assert_eq!(error_code(&envelopes), "cdp_attach_failed");
}

#[tokio::test(start_paused = true)]
async fn request_validation_failures_report_precise_codes() {
	let (engine, _world) = default_engine();
	let launched = launch(&engine, "client-a").await;

	let unknown = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"page.reload",
		json!({}),
	)
	.await;
	assert_eq!(error_code(&unknown), "invalid_request");

	let no_session = request(&engine, "client-a", None, None, "session.status", json!({})).await;
	assert_eq!(error_code(&no_session), "invalid_request");

	let bad_session = request(
		&engine,
		"client-a",
		Some("ops-0-missing"),
		Some(&launched.lease_id),
		"session.status",
		json!({}),
	)
	.await;
	assert_eq!(error_code(&bad_session), "invalid_session");

	let bad_lease = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some("lease-0-wrong"),
		"session.status",
		json!({}),
	)
	.await;
	assert_eq!(error_code(&bad_lease), "not_owner");

	// A matching lease from another connection only wins on the reclaim
	// edge; the session is still active and owned.
	let stranger = request(
		&engine,
		"client-b",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"session.status",
		json!({}),
	)
	.await;
	assert_eq!(error_code(&stranger), "not_owner");

	let malformed = request(
		&engine,
		"client-a",
		Some(&launched.session_id),
		Some(&launched.lease_id),
		"dom.click",
		json!({ "selector": 7 }),
	)
	.await;
	assert_eq!(error_code(&malformed), "invalid_request");
}

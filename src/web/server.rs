use axum::{
    routing::{get, post},
    Router,
    response::Html,
};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use super::{api, AppState};

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(serve_dashboard))
        .route("/api/health", get(api::health_check))
        .route("/api/overview", get(api::get_overview))
        .route("/api/positions", get(api::get_positions).post(api::post_open_position))
        .route("/api/positions/:id", get(api::get_position))
        .route("/api/positions/:id/close", post(api::post_close_position))
        .route("/api/analysis", get(api::get_analysis))
        .route("/api/watchlist", get(api::get_watchlist))
        .layer(cors)
        .with_state(state)
}

pub async fn start_dashboard_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Dashboard server starting on http://localhost:{}", port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

async fn serve_dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

const DASHBOARD_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>AI Paper Trader</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #0f1419;
            color: #e7e9ea;
        }
        .header { background: #16202a; padding: 1rem 2rem; border-bottom: 1px solid #2f3336; }
        .header h1 { font-size: 1.5rem; color: #1da1f2; }
        .container { padding: 1.5rem; max-width: 1400px; margin: 0 auto; }
        .grid { display: grid; gap: 1.5rem; margin-bottom: 1.5rem; }
        .grid-3 { grid-template-columns: repeat(3, 1fr); }
        .grid-main { grid-template-columns: 1fr 2fr; }
        @media (max-width: 900px) { .grid-3, .grid-main { grid-template-columns: 1fr; } }
        .card { background: #16202a; border-radius: 12px; padding: 1.5rem; border: 1px solid #2f3336; }
        .card-title { font-size: 0.875rem; color: #71767b; text-transform: uppercase; margin-bottom: 0.75rem; }
        .card-value { font-size: 2rem; font-weight: 700; }
        .positive { color: #00ba7c; }
        .negative { color: #f4212e; }
        .muted { color: #71767b; }
        label { display: block; margin: 0.75rem 0 0.25rem; color: #71767b; font-size: 0.875rem; }
        select, input {
            width: 100%; padding: 0.5rem; border-radius: 6px;
            border: 1px solid #2f3336; background: #0f1419; color: #e7e9ea;
        }
        button {
            margin-top: 1rem; width: 100%; padding: 0.6rem; border: none; border-radius: 6px;
            background: #1da1f2; color: white; font-weight: 600; cursor: pointer;
        }
        button.close { background: #f4212e; width: auto; margin: 0; padding: 0.3rem 0.8rem; }
        .message { margin-top: 1rem; font-size: 0.875rem; }
        .bar { height: 10px; background: #2f3336; border-radius: 5px; margin: 0.5rem 0; }
        .bar > div { height: 100%; background: #1da1f2; border-radius: 5px; }
        table { width: 100%; border-collapse: collapse; }
        th, td { padding: 0.6rem; text-align: left; border-bottom: 1px solid #2f3336; font-size: 0.875rem; }
        th { color: #71767b; font-weight: 500; text-transform: uppercase; font-size: 0.75rem; }
    </style>
</head>
<body>
    <div class="header"><h1>AI Paper Trader</h1></div>
    <div class="container">
        <div class="grid grid-3">
            <div class="card"><div class="card-title">Wallet (USDT)</div><div class="card-value" id="balance">-</div></div>
            <div class="card"><div class="card-title">Open Positions (entry value)</div><div class="card-value" id="open-value">-</div></div>
            <div class="card"><div class="card-title">Total</div><div class="card-value" id="total">-</div></div>
        </div>

        <div class="grid grid-main">
            <div class="card">
                <div class="card-title">Trade</div>
                <label for="coin">Coin</label>
                <select id="coin"></select>
                <label for="invest">Investment (USDT)</label>
                <input id="invest" type="number" value="100" step="10">
                <button id="open">Open position (buy)</button>
                <div class="message" id="trade-message"></div>

                <div class="card-title" style="margin-top: 1.5rem">Analysis</div>
                <div id="analysis" class="muted">Select a coin</div>
            </div>

            <div class="card">
                <div class="card-title">Open Positions</div>
                <table>
                    <thead><tr><th>#</th><th>Symbol</th><th>Amount</th><th>Entry</th><th>Price</th><th>PnL</th><th></th></tr></thead>
                    <tbody id="open-positions"></tbody>
                </table>

                <div class="card-title" style="margin-top: 1.5rem">Trade History</div>
                <table>
                    <thead><tr><th>#</th><th>Symbol</th><th>Amount</th><th>Entry</th><th>Exit</th><th>PnL</th><th>Closed</th></tr></thead>
                    <tbody id="closed-positions"></tbody>
                </table>
            </div>
        </div>
    </div>

    <script>
        const fmt = (v, dp) => Number(v).toFixed(dp);
        const pct = (v) => (v >= 0 ? '+' : '') + (Number(v) * 100).toFixed(2) + '%';
        const cls = (v) => Number(v) >= 0 ? 'positive' : 'negative';

        async function loadWatchlist() {
            const data = await (await fetch('/api/watchlist')).json();
            const select = document.getElementById('coin');
            select.innerHTML = data.symbols.map(s => `<option>${s}</option>`).join('');
            document.getElementById('invest').min = data.min_investment;
            select.addEventListener('change', loadAnalysis);
        }

        async function loadOverview() {
            const o = await (await fetch('/api/overview')).json();
            document.getElementById('balance').textContent = fmt(o.balance, 2);
            document.getElementById('open-value').textContent = fmt(o.open_value_at_entry, 2);
            document.getElementById('total').textContent = fmt(o.total_at_entry, 2);
            document.getElementById('open-positions').innerHTML = o.positions.map(p => `
                <tr>
                    <td>${p.id}</td><td>${p.symbol}</td><td>${fmt(p.amount, 4)}</td>
                    <td>${fmt(p.entry_price, 4)}</td>
                    <td>${fmt(p.current_price, 4)}${p.price_available ? '' : ' <span class="muted">(entry)</span>'}</td>
                    <td class="${cls(p.unrealized_pnl_pct)}">${pct(p.unrealized_pnl_pct)}</td>
                    <td><button class="close" onclick="closePosition(${p.id})">Close</button></td>
                </tr>`).join('') || '<tr><td colspan="7" class="muted">No open positions</td></tr>';
        }

        async function loadHistory() {
            const rows = await (await fetch('/api/positions?open=false')).json();
            document.getElementById('closed-positions').innerHTML = rows.map(p => `
                <tr>
                    <td>${p.id}</td><td>${p.symbol}</td><td>${fmt(p.amount, 4)}</td>
                    <td>${fmt(p.entry_price, 4)}</td><td>${fmt(p.close_price, 4)}</td>
                    <td class="${cls(p.pnl_pct)}">${pct(p.pnl_pct)}</td>
                    <td>${new Date(p.close_date).toLocaleString()}</td>
                </tr>`).join('');
        }

        async function loadAnalysis() {
            const symbol = document.getElementById('coin').value;
            const el = document.getElementById('analysis');
            el.textContent = 'Loading...';
            const a = await (await fetch('/api/analysis?symbol=' + encodeURIComponent(symbol))).json();
            if (a.market_error) {
                el.textContent = '';
                el.appendChild(negative(a.market_error));
                return;
            }
            let html = `<div>Price: <b>${fmt(a.current_price, 4)}</b></div>`;
            const s = a.signal;
            if (s.status === 'ready') {
                const p = (s.probability * 100).toFixed(2);
                html += `<div class="bar"><div style="width:${p}%"></div></div>`;
                html += `<div>Buy probability: ${p}% (threshold ${(s.threshold * 100).toFixed(2)}%)</div>`;
                html += s.label === 'BUY'
                    ? '<div class="positive">Model sees a potential buy signal</div>'
                    : '<div class="muted">Model does not suggest buying right now</div>';
            } else if (s.status === 'insufficient_data') {
                html += '<div class="muted">Not enough history for a prediction</div>';
            } else if (s.status === 'disabled') {
                html += '<div class="muted">Signal model not loaded</div>';
            }
            el.innerHTML = html;
            if (s.status === 'failed') {
                el.appendChild(negative(s.reason));
            }
        }

        function negative(text) {
            const div = document.createElement('div');
            div.className = 'negative';
            div.textContent = text;
            return div;
        }

        async function openPosition() {
            const body = {
                symbol: document.getElementById('coin').value,
                invest_usdt: document.getElementById('invest').value,
            };
            const resp = await fetch('/api/positions', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify(body),
            });
            showOutcome(await resp.json(), resp.ok);
        }

        async function closePosition(id) {
            const resp = await fetch(`/api/positions/${id}/close`, { method: 'POST' });
            showOutcome(await resp.json(), resp.ok);
        }

        function showOutcome(outcome, ok) {
            const el = document.getElementById('trade-message');
            el.className = 'message ' + (ok ? 'positive' : 'negative');
            el.textContent = outcome.message || outcome.error;
            refresh();
        }

        function refresh() {
            loadOverview();
            loadHistory();
        }

        document.getElementById('open').addEventListener('click', openPosition);
        loadWatchlist().then(loadAnalysis);
        refresh();
        setInterval(refresh, 60000);
    </script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::tests::{dashboard, market, signal};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> Router {
        router(AppState::new(dashboard(market(), Some(signal(0.4))).await))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_page() {
        let app = app().await;
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_page_renders_error_strings_as_text() {
        let app = app().await;
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(page.contains("div.textContent = text"));
        assert!(page.contains("negative(a.market_error)"));
        assert!(page.contains("negative(s.reason)"));
        assert!(!page.contains("${a.market_error}"));
        assert!(!page.contains("${s.reason}"));
    }

    #[tokio::test]
    async fn test_open_then_close_through_router() {
        let app = app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/positions",
            Some(serde_json::json!({"symbol": "ETH/USDT", "invest_usdt": "100"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "completed");
        let id = body["position"]["id"].as_i64().unwrap();

        let (status, overview) = send(&app, "GET", "/api/overview", None).await;
        assert_eq!(status, StatusCode::OK);
        let balance: Decimal = overview["balance"].as_str().unwrap().parse().unwrap();
        assert_eq!(balance, dec!(9900));
        assert_eq!(overview["positions"].as_array().unwrap().len(), 1);

        let (status, position) = send(&app, "GET", &format!("/api/positions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(position["symbol"], "ETH/USDT");

        let (status, body) = send(&app, "POST", &format!("/api/positions/{}/close", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["position"]["is_open"], false);

        let (status, _) = send(&app, "POST", &format!("/api/positions/{}/close", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, closed) = send(&app, "GET", "/api/positions?open=false", None).await;
        assert_eq!(closed.as_array().unwrap().len(), 1);
        let (_, open) = send(&app, "GET", "/api/positions", None).await;
        assert!(open.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejections() {
        let app = app().await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/positions",
            Some(serde_json::json!({"symbol": "ETH/USDT", "invest_usdt": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "rejected");

        let (status, _) = send(
            &app,
            "POST",
            "/api/positions",
            Some(serde_json::json!({"symbol": "ETHUSDT", "invest_usdt": 50})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/api/positions/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", "/api/positions/99/close", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analysis_and_watchlist() {
        let app = app().await;

        let (status, body) = send(&app, "GET", "/api/analysis?symbol=SOL/USDT", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "SOL/USDT");
        assert_eq!(body["signal"]["status"], "ready");
        assert_eq!(body["signal"]["label"], "HOLD");

        let (status, body) = send(&app, "GET", "/api/watchlist", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbols"][0], "ETH/USDT");
        assert_eq!(body["symbols"].as_array().unwrap().len(), 10);
    }
}

// Embedded operator dashboard page. Grounded on `engine/webchat.rs`'s
// `build_chat_html` idiom: a single raw-string HTML document with inline
// CSS and a small vanilla-JS polling loop, served verbatim with no
// templating engine.

pub fn render() -> String {
    r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width,initial-scale=1">
<title>keyproxy dashboard</title>
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#1e1e1e;color:#cccccc;padding:20px}
h1{font-size:18px;color:#ff00ff;margin-bottom:16px}
.grid{display:grid;grid-template-columns:repeat(auto-fill,minmax(260px,1fr));gap:12px;margin-bottom:24px}
.card{background:#252526;border:1px solid #3c3c3c;border-radius:8px;padding:14px}
.card h2{font-size:13px;color:#888;margin-bottom:8px;text-transform:uppercase}
.card .val{font-size:22px;font-weight:600}
table{width:100%;border-collapse:collapse;font-size:13px;margin-bottom:24px}
th,td{padding:6px 10px;border-bottom:1px solid #3c3c3c;text-align:left}
th{color:#888;font-weight:600}
.ok{color:#0f0}
.penalized{color:#f80}
.ratelimited{color:#fa0}
.offline{color:#f44}
pre{background:#151515;border:1px solid #3c3c3c;border-radius:6px;padding:10px;font-size:12px;max-height:240px;overflow:auto}
button{padding:4px 10px;background:#ff00ff;color:#fff;border:none;border-radius:4px;font-size:12px;cursor:pointer;margin-right:4px}
</style>
</head>
<body>
<h1>keyproxy</h1>
<div class="grid" id="statsGrid"></div>
<table id="keysTable">
  <thead><tr><th>key</th><th>status</th><th>expires in</th><th>429 lvl</th><th>5xx lvl</th><th>usage (2h)</th><th>actions</th></tr></thead>
  <tbody></tbody>
</table>
<h2 style="font-size:13px;color:#888;margin-bottom:8px">recent logs</h2>
<pre id="logBox"></pre>
<script>
async function refresh(){
  const [health, keys, logs] = await Promise.all([
    fetch("/stats").then(r=>r.json()),
    fetch("/health/keys").then(r=>r.json()),
    fetch("/logs?limit=50").then(r=>r.json())
  ]);
  const grid=document.getElementById("statsGrid");
  grid.innerHTML=`<div class="card"><h2>total tokens</h2><div class="val">${health.total_tokens}</div></div>`;
  const tbody=document.querySelector("#keysTable tbody");
  tbody.innerHTML="";
  Object.keys(keys).sort((a,b)=>a-b).forEach(i=>{
    const k=keys[i];
    const cls=k.status_label==="OK"?"ok":k.status_label==="RATE LIMITED"?"ratelimited":k.status_label==="OFFLINE"?"offline":"penalized";
    const row=document.createElement("tr");
    row.innerHTML=`<td>${i}</td><td class="${cls}">${k.status_label}</td><td>${k.expires_in_seconds}s</td><td>${k.backoff_level}</td><td>${k.backoff_level}</td><td>${k.usage_2h}</td>
      <td><button onclick="resetKey(${i})">reset</button><button onclick="penalizeKey(${i})">penalize</button></td>`;
    tbody.appendChild(row);
  });
  document.getElementById("logBox").textContent=logs.map(l=>`[${l.timestamp}] ${l.level} ${l.target}: ${l.message}`).join("\n");
}

async function resetKey(i){ await fetch(`/health/keys/${i}/reset`,{method:"POST"}); refresh(); }
async function penalizeKey(i){ await fetch(`/health/keys/${i}/penalize`,{method:"POST"}); refresh(); }

refresh();
setInterval(refresh, 5000);
</script>
</body>
</html>"##
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_non_empty_html_document() {
        let html = render();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("keyproxy"));
    }
}

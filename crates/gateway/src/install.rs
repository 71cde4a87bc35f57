//! Agent install script, served from `/api/v1/agents/register/install.sh`.
//!
//! The script is rendered per request with the hub URL substituted, and is
//! designed to be piped straight into `sudo bash`.

/// Render the installer for the given hub base URL.
pub fn render_install_script(hub_url: &str) -> String {
    INSTALL_SCRIPT_TEMPLATE.replace("__HUB_URL__", hub_url)
}

/// The `curl | sudo bash` one-liner shown alongside freshly minted tokens.
pub fn install_command(hub_url: &str, plaintext_token: &str) -> String {
    format!(
        "curl -sSL {hub_url}/api/v1/agents/register/install.sh | sudo bash -s -- --token {plaintext_token}"
    )
}

const INSTALL_SCRIPT_TEMPLATE: &str = r#"#!/bin/bash
# Homelab Hub agent installation script (pull-based)
# Generated by hub at: __HUB_URL__
#
# Usage:
#   curl -sSL __HUB_URL__/api/v1/agents/register/install.sh | sudo bash -s -- --token hlh_rt_xxx

set -euo pipefail

HUB_URL="__HUB_URL__"
TOKEN=""
SERVER_ID=""
INSTALL_DIR="/opt/homelab-agent"
CONFIG_DIR="/etc/homelab-agent"

while [[ $# -gt 0 ]]; do
    case $1 in
        --token)
            TOKEN="$2"
            shift 2
            ;;
        --server-id)
            SERVER_ID="$2"
            shift 2
            ;;
        *)
            echo "Unknown option: $1" >&2
            exit 1
            ;;
    esac
done

if [[ -z "$TOKEN" ]]; then
    echo "Error: --token is required" >&2
    echo "Usage: curl -sSL $HUB_URL/api/v1/agents/register/install.sh | sudo bash -s -- --token hlh_rt_xxx" >&2
    exit 1
fi

if [[ $EUID -ne 0 ]]; then
    echo "Error: this script must be run as root (use sudo)" >&2
    exit 1
fi

# Derive server_id from hostname if not provided.
if [[ -z "$SERVER_ID" ]]; then
    SERVER_ID=$(hostname | tr '[:upper:]' '[:lower:]' | sed 's/[^a-z0-9-]/-/g' | sed 's/--*/-/g' | sed 's/^-//' | sed 's/-$//')
    if [[ -z "$SERVER_ID" ]]; then
        SERVER_ID="server-$(date +%s)"
    fi
fi

HOSTNAME=$(hostname)

echo "=== Homelab Hub Agent Installation ==="
echo "Hub URL: $HUB_URL"
echo "Server ID: $SERVER_ID"
echo "Hostname: $HOSTNAME"
echo ""

echo "Claiming registration token..."
CLAIM_RESPONSE=$(curl -sSL -X POST "$HUB_URL/api/v1/agents/register/claim" \
    -H "Content-Type: application/json" \
    -d "{\"token\": \"$TOKEN\", \"server_id\": \"$SERVER_ID\", \"hostname\": \"$HOSTNAME\"}") || {
    echo "Error: failed to claim token" >&2
    echo "$CLAIM_RESPONSE" >&2
    exit 1
}

if echo "$CLAIM_RESPONSE" | grep -q '"success":false'; then
    echo "Error: token claim failed" >&2
    echo "$CLAIM_RESPONSE" >&2
    exit 1
fi

CONFIG_YAML=$(echo "$CLAIM_RESPONSE" | python3 -c "import sys, json; print(json.load(sys.stdin).get('config_yaml', ''))" 2>/dev/null) || {
    echo "Error: failed to parse claim response" >&2
    echo "$CLAIM_RESPONSE" >&2
    exit 1
}

if [[ -z "$CONFIG_YAML" ]]; then
    echo "Error: no configuration received from hub" >&2
    exit 1
fi

echo "Token claimed successfully."
echo ""

echo "Writing configuration..."
mkdir -p "$INSTALL_DIR"
mkdir -p "$CONFIG_DIR"
echo "$CONFIG_YAML" > "$CONFIG_DIR/config.yaml"
chmod 600 "$CONFIG_DIR/config.yaml"

# Existing installation: refresh the config and restart, nothing else.
if [[ -f "$INSTALL_DIR/VERSION" ]]; then
    echo "Existing agent found, updating configuration only..."
    systemctl restart homelab-agent 2>/dev/null || true
    echo "=== Configuration Updated ==="
    exit 0
fi

echo "Downloading agent..."
curl -sSL "$HUB_URL/api/v1/agents/download" -o /tmp/homelab-agent.tar.gz || {
    echo "Error: could not download agent from hub" >&2
    exit 1
}
tar -xzf /tmp/homelab-agent.tar.gz -C "$INSTALL_DIR"
rm /tmp/homelab-agent.tar.gz

echo "Creating systemd service..."
MODE=$(grep "^mode:" "$CONFIG_DIR/config.yaml" | awk '{print $2}' || echo "readonly")

if [[ "$MODE" == "readwrite" ]]; then
    SERVICE_USER="root"
else
    # Unprivileged user for readonly mode.
    if ! id homelab-agent &>/dev/null; then
        useradd --system --no-create-home --shell /usr/sbin/nologin homelab-agent
    fi
    SERVICE_USER="homelab-agent"
    chown -R homelab-agent:homelab-agent "$CONFIG_DIR"
    chmod 750 "$CONFIG_DIR"
fi

cat > /etc/systemd/system/homelab-agent.service <<EOF
[Unit]
Description=Homelab Hub Monitoring Agent
After=network.target

[Service]
Type=simple
User=$SERVICE_USER
ExecStart=$INSTALL_DIR/homelab-agent -c $CONFIG_DIR/config.yaml
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
EOF

echo "Enabling and starting service..."
systemctl daemon-reload
systemctl enable homelab-agent
systemctl start homelab-agent

echo ""
echo "=== Installation Complete ==="
echo "Check status: systemctl status homelab-agent"
echo "View logs: journalctl -u homelab-agent -f"
"#;

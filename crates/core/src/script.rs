//! Builds the scripts a job runs from a browser request.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::JobsConfig;
use crate::job::Invocation;

pub const DEFAULT_REPORT_NAME: &str = "AzureResourceInventory";

/// Clouds `Invoke-ARI -AzureEnvironment` accepts.
pub const AZURE_ENVIRONMENTS: [&str; 4] = [
    "AzureCloud",
    "AzureUSGovernment",
    "AzureChinaCloud",
    "AzureGermanCloud",
];

static GUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$")
        .expect("GUID pattern")
});

static REPORT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("report name pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    DeviceLogin,
    ResourceInventory,
    InventoryReport,
    EnvironmentCheck,
}

impl ScriptKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::DeviceLogin => "Azure CLI device login",
            Self::ResourceInventory => "Azure CLI resource inventory",
            Self::InventoryReport => "Azure Resource Inventory report",
            Self::EnvironmentCheck => "PowerShell environment check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub kind: ScriptKind,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub report_name: Option<String>,
    #[serde(default)]
    pub include_tags: bool,
    #[serde(default)]
    pub skip_advisory: bool,
    #[serde(default)]
    pub skip_diagram: bool,
    #[serde(default)]
    pub security_center: bool,
    #[serde(default)]
    pub lite: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_device_login")]
    pub device_login: bool,
    #[serde(default)]
    pub azure_environment: Option<String>,
}

fn default_device_login() -> bool {
    true
}

impl ScriptRequest {
    pub fn new(kind: ScriptKind) -> Self {
        Self {
            kind,
            tenant: None,
            subscription: None,
            report_name: None,
            include_tags: false,
            skip_advisory: false,
            skip_diagram: false,
            security_center: false,
            lite: false,
            debug: false,
            device_login: default_device_login(),
            azure_environment: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("tenant must be a GUID (xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)")]
    InvalidTenant,
    #[error("subscription must be a GUID (xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)")]
    InvalidSubscription,
    #[error("report name may only contain letters, digits, '_' and '-' (max 64)")]
    InvalidReportName,
    #[error("azure environment must be one of: AzureCloud, AzureUSGovernment, AzureChinaCloud, AzureGermanCloud")]
    InvalidAzureEnvironment,
}

/// Validated request fields; blank optional values are treated as absent.
struct Validated<'a> {
    tenant: Option<&'a str>,
    subscription: Option<&'a str>,
    report_name: &'a str,
    azure_environment: Option<&'a str>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn validate(request: &ScriptRequest) -> Result<Validated<'_>, ScriptError> {
    let tenant = non_blank(&request.tenant);
    if tenant.is_some_and(|t| !GUID_RE.is_match(t)) {
        return Err(ScriptError::InvalidTenant);
    }

    let subscription = non_blank(&request.subscription);
    if subscription.is_some_and(|s| !GUID_RE.is_match(s)) {
        return Err(ScriptError::InvalidSubscription);
    }

    let report_name = non_blank(&request.report_name).unwrap_or(DEFAULT_REPORT_NAME);
    if !REPORT_NAME_RE.is_match(report_name) {
        return Err(ScriptError::InvalidReportName);
    }

    let azure_environment = non_blank(&request.azure_environment);
    if azure_environment.is_some_and(|env| !AZURE_ENVIRONMENTS.contains(&env)) {
        return Err(ScriptError::InvalidAzureEnvironment);
    }

    Ok(Validated {
        tenant,
        subscription,
        report_name,
        azure_environment,
    })
}

/// Turns a request into the invocation a job runner executes.
pub fn build_invocation(
    request: &ScriptRequest,
    jobs: &JobsConfig,
    output_dir: &Path,
) -> Result<Invocation, ScriptError> {
    let fields = validate(request)?;
    let out_dir = output_dir.to_string_lossy();

    let (program, args, script, script_extension) = match request.kind {
        ScriptKind::DeviceLogin => (
            jobs.shell.clone(),
            Vec::new(),
            device_login_script(&out_dir, &fields),
            "sh",
        ),
        ScriptKind::ResourceInventory => (
            jobs.shell.clone(),
            Vec::new(),
            resource_inventory_script(&out_dir, &fields),
            "sh",
        ),
        ScriptKind::InventoryReport => (
            jobs.pwsh.clone(),
            vec!["-NoProfile".to_string(), "-File".to_string()],
            inventory_report_script(&out_dir, request, &fields),
            "ps1",
        ),
        ScriptKind::EnvironmentCheck => (
            jobs.pwsh.clone(),
            vec!["-NoProfile".to_string(), "-File".to_string()],
            environment_check_script(),
            "ps1",
        ),
    };

    Ok(Invocation {
        label: request.kind.label().to_string(),
        program,
        args,
        script,
        script_extension: script_extension.to_string(),
    })
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn bash_preamble(out_dir: &str, title: &str) -> Vec<String> {
    vec![
        "#!/bin/bash".to_string(),
        "set -e".to_string(),
        format!("OUT_DIR={}", sh_quote(out_dir)),
        "mkdir -p \"$OUT_DIR\"".to_string(),
        String::new(),
        format!("echo '{title}'"),
        format!("echo '{}'", "=".repeat(title.len())),
        String::new(),
    ]
}

fn device_login_script(out_dir: &str, fields: &Validated<'_>) -> String {
    let mut lines = bash_preamble(out_dir, "AZURE CLI DEVICE LOGIN");
    lines.extend(
        [
            "echo 'Clearing existing Azure CLI authentication...'",
            "az logout 2>/dev/null || true",
            "az account clear 2>/dev/null || true",
            "",
            "echo 'Starting Azure CLI device login...'",
            "echo 'YOU MUST COMPLETE THE DEVICE LOGIN IN YOUR BROWSER!'",
        ]
        .map(String::from),
    );

    match fields.tenant {
        Some(tenant) => lines.push(format!("az login --tenant {} --use-device-code", sh_quote(tenant))),
        None => lines.push("az login --use-device-code".to_string()),
    }
    if let Some(subscription) = fields.subscription {
        lines.push(format!("echo 'Setting subscription to: {subscription}'"));
        lines.push(format!("az account set --subscription {}", sh_quote(subscription)));
    }

    lines.extend(
        [
            "",
            "echo 'Verifying authentication...'",
            "az account show",
            "",
            "echo 'Azure CLI authentication completed!'",
        ]
        .map(String::from),
    );
    lines.join("\n") + "\n"
}

fn resource_inventory_script(out_dir: &str, fields: &Validated<'_>) -> String {
    let mut lines = bash_preamble(out_dir, "AZURE CLI RESOURCE INVENTORY");
    lines.extend(
        [
            "echo 'Checking Azure CLI authentication...'",
            "if ! az account show &>/dev/null; then",
            "    echo 'Not authenticated. Starting device login...'",
        ]
        .map(String::from),
    );
    match fields.tenant {
        Some(tenant) => lines.push(format!(
            "    az login --tenant {} --use-device-code",
            sh_quote(tenant)
        )),
        None => lines.push("    az login --use-device-code".to_string()),
    }
    lines.push("fi".to_string());
    lines.push("echo 'Authentication confirmed!'".to_string());

    if let Some(subscription) = fields.subscription {
        lines.push(format!("echo 'Setting subscription: {subscription}'"));
        lines.push(format!("az account set --subscription {}", sh_quote(subscription)));
    }

    lines.extend(
        [
            "",
            "echo 'Generating Azure Resource Inventory...'",
            "SUMMARY=\"$OUT_DIR/azure-resource-inventory.txt\"",
            "echo 'Account Information:' > \"$SUMMARY\"",
            "az account show >> \"$SUMMARY\"",
            "echo '' >> \"$SUMMARY\"",
            "echo 'Resource Groups:' >> \"$SUMMARY\"",
            "az group list --output table >> \"$SUMMARY\"",
            "echo '' >> \"$SUMMARY\"",
            "echo 'All Resources:' >> \"$SUMMARY\"",
            "az resource list --output table >> \"$SUMMARY\"",
            "",
            "echo 'Exporting detailed resource information...'",
            "az resource list --output json > \"$OUT_DIR/resources-detailed.json\"",
            "az group list --output json > \"$OUT_DIR/resource-groups.json\"",
            "",
            "echo 'Generating CSV export...'",
            "az resource list --query '[].{Name:name,Type:type,ResourceGroup:resourceGroup,Location:location}' --output tsv > \"$OUT_DIR/resources.csv\"",
            "printf 'Name\\tType\\tResourceGroup\\tLocation\\n' > \"$OUT_DIR/resources-with-headers.csv\"",
            "cat \"$OUT_DIR/resources.csv\" >> \"$OUT_DIR/resources-with-headers.csv\"",
            "",
            "echo 'Azure CLI Resource Inventory completed!'",
            "echo 'Files generated:'",
            "ls -la \"$OUT_DIR/\"",
        ]
        .map(String::from),
    );
    lines.join("\n") + "\n"
}

fn inventory_report_script(
    out_dir: &str,
    request: &ScriptRequest,
    fields: &Validated<'_>,
) -> String {
    let mut invoke = vec![
        "Invoke-ARI".to_string(),
        format!("-ReportDir {}", ps_quote(out_dir)),
        format!("-ReportName {}", ps_quote(fields.report_name)),
    ];
    if request.device_login {
        invoke.push("-DeviceLogin".to_string());
    }
    if let Some(environment) = fields.azure_environment {
        invoke.push(format!("-AzureEnvironment {}", ps_quote(environment)));
    }
    if let Some(tenant) = fields.tenant {
        invoke.push(format!("-TenantID {}", ps_quote(tenant)));
    }
    if let Some(subscription) = fields.subscription {
        invoke.push(format!("-SubscriptionID {}", ps_quote(subscription)));
    }
    if request.include_tags {
        invoke.push("-IncludeTags".to_string());
    }
    if request.skip_advisory {
        invoke.push("-SkipAdvisory".to_string());
    }
    if request.skip_diagram {
        invoke.push("-SkipDiagram".to_string());
    }
    if request.security_center {
        invoke.push("-SecurityCenter".to_string());
    }
    if request.lite {
        invoke.push("-Lite".to_string());
    }
    if request.debug {
        invoke.push("-Debug".to_string());
    }

    [
        "$ErrorActionPreference = 'Stop'".to_string(),
        "Import-Module AzureResourceInventory -Force".to_string(),
        format!("$out = {}", ps_quote(out_dir)),
        "New-Item -ItemType Directory -Force -Path $out | Out-Null".to_string(),
        invoke.join(" "),
        String::new(),
    ]
    .join("\n")
}

/// Reports the PowerShell version and which inventory modules are installed.
/// Missing modules are printed, not raised, so the job completes either way.
fn environment_check_script() -> String {
    [
        "$ErrorActionPreference = 'Continue'",
        "Write-Output \"PowerShell: $($PSVersionTable.PSVersion.ToString())\"",
        "$ari = Get-Module -ListAvailable -Name AzureResourceInventory | Sort-Object Version -Descending | Select-Object -First 1",
        "if ($ari) { Write-Output \"AzureResourceInventory: $($ari.Version)\" } else { Write-Output 'AzureResourceInventory: not installed' }",
        "$az = Get-Module -ListAvailable -Name Az.* | Sort-Object Name -Unique",
        "if ($az) { $az | ForEach-Object { Write-Output \"$($_.Name): $($_.Version)\" } } else { Write-Output 'Az modules: not installed' }",
        "",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TENANT: &str = "11111111-2222-3333-4444-555555555555";
    const SUBSCRIPTION: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    fn build(request: &ScriptRequest) -> Result<Invocation, ScriptError> {
        build_invocation(request, &JobsConfig::default(), Path::new("/srv/reports"))
    }

    #[test]
    fn device_login_uses_shell_and_tenant() {
        let mut request = ScriptRequest::new(ScriptKind::DeviceLogin);
        request.tenant = Some(TENANT.to_string());
        request.subscription = Some(SUBSCRIPTION.to_string());

        let invocation = build(&request).unwrap();
        assert_eq!(invocation.program, "/bin/bash");
        assert!(invocation.args.is_empty());
        assert_eq!(invocation.script_extension, "sh");
        assert_eq!(invocation.label, "Azure CLI device login");
        assert!(invocation
            .script
            .contains(&format!("az login --tenant '{TENANT}' --use-device-code")));
        assert!(invocation
            .script
            .contains(&format!("az account set --subscription '{SUBSCRIPTION}'")));
        assert!(invocation.script.contains("OUT_DIR='/srv/reports'"));
    }

    #[test]
    fn blank_optional_fields_are_ignored() {
        let mut request = ScriptRequest::new(ScriptKind::DeviceLogin);
        request.tenant = Some("   ".to_string());

        let invocation = build(&request).unwrap();
        assert!(invocation.script.contains("az login --use-device-code"));
        assert!(!invocation.script.contains("--tenant"));
        assert!(!invocation.script.contains("az account set"));
    }

    #[test]
    fn resource_inventory_writes_expected_reports() {
        let invocation = build(&ScriptRequest::new(ScriptKind::ResourceInventory)).unwrap();
        for file in [
            "azure-resource-inventory.txt",
            "resources-detailed.json",
            "resource-groups.json",
            "resources.csv",
            "resources-with-headers.csv",
        ] {
            assert!(invocation.script.contains(file), "missing {file}");
        }
    }

    #[test]
    fn inventory_report_runs_pwsh_with_switches() {
        let mut request = ScriptRequest::new(ScriptKind::InventoryReport);
        request.report_name = Some("Quarterly_2024".to_string());
        request.include_tags = true;
        request.skip_diagram = true;

        let invocation = build(&request).unwrap();
        assert_eq!(invocation.program, "pwsh");
        assert_eq!(invocation.args, vec!["-NoProfile", "-File"]);
        assert_eq!(invocation.script_extension, "ps1");
        assert!(invocation.script.contains("-ReportName 'Quarterly_2024'"));
        assert!(invocation.script.contains("-IncludeTags"));
        assert!(invocation.script.contains("-SkipDiagram"));
        assert!(!invocation.script.contains("-SkipAdvisory"));
        assert!(invocation.script.contains("-DeviceLogin"));
    }

    #[test]
    fn inventory_report_passes_extended_switches() {
        let mut request = ScriptRequest::new(ScriptKind::InventoryReport);
        request.security_center = true;
        request.lite = true;
        request.debug = true;
        request.azure_environment = Some("AzureUSGovernment".to_string());

        let script = build(&request).unwrap().script;
        assert!(script.contains("-SecurityCenter"));
        assert!(script.contains("-Lite"));
        assert!(script.contains("-Debug"));
        assert!(script.contains("-AzureEnvironment 'AzureUSGovernment'"));
    }

    #[test]
    fn device_login_switch_can_be_turned_off() {
        let mut request = ScriptRequest::new(ScriptKind::InventoryReport);
        request.device_login = false;

        let script = build(&request).unwrap().script;
        assert!(!script.contains("-DeviceLogin"));
        assert!(!script.contains("-AzureEnvironment"));
        assert!(!script.contains("-SecurityCenter"));
    }

    #[test]
    fn rejects_unknown_azure_environment() {
        let mut request = ScriptRequest::new(ScriptKind::InventoryReport);
        request.azure_environment = Some("AzureCloud'; Remove-Item /".to_string());
        assert_eq!(
            build(&request).unwrap_err(),
            ScriptError::InvalidAzureEnvironment
        );

        request.azure_environment = Some("  ".to_string());
        assert!(build(&request).is_ok());
    }

    #[test]
    fn environment_check_reports_versions_and_modules() {
        let invocation = build(&ScriptRequest::new(ScriptKind::EnvironmentCheck)).unwrap();
        assert_eq!(invocation.program, "pwsh");
        assert_eq!(invocation.args, vec!["-NoProfile", "-File"]);
        assert_eq!(invocation.script_extension, "ps1");
        assert_eq!(invocation.label, "PowerShell environment check");
        assert!(invocation.script.contains("$PSVersionTable.PSVersion"));
        assert!(invocation
            .script
            .contains("Get-Module -ListAvailable -Name AzureResourceInventory"));
        assert!(invocation.script.contains("Get-Module -ListAvailable -Name Az.*"));
    }

    #[test]
    fn default_report_name_is_used_when_absent() {
        let invocation = build(&ScriptRequest::new(ScriptKind::InventoryReport)).unwrap();
        assert!(invocation
            .script
            .contains(&format!("-ReportName '{DEFAULT_REPORT_NAME}'")));
    }

    #[test]
    fn rejects_malformed_identifiers() {
        let mut request = ScriptRequest::new(ScriptKind::DeviceLogin);
        request.tenant = Some("not-a-guid".to_string());
        assert_eq!(build(&request).unwrap_err(), ScriptError::InvalidTenant);

        let mut request = ScriptRequest::new(ScriptKind::ResourceInventory);
        request.subscription = Some(format!("{SUBSCRIPTION}; rm -rf /"));
        assert_eq!(build(&request).unwrap_err(), ScriptError::InvalidSubscription);

        let mut request = ScriptRequest::new(ScriptKind::InventoryReport);
        request.report_name = Some("../report".to_string());
        assert_eq!(build(&request).unwrap_err(), ScriptError::InvalidReportName);
    }

    #[test]
    fn output_dir_with_quote_is_escaped() {
        let invocation = build_invocation(
            &ScriptRequest::new(ScriptKind::DeviceLogin),
            &JobsConfig::default(),
            Path::new("/tmp/it's here"),
        )
        .unwrap();
        assert!(invocation.script.contains(r"OUT_DIR='/tmp/it'\''s here'"));
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: ScriptRequest =
            serde_json::from_str(r#"{"kind":"resource_inventory"}"#).unwrap();
        assert_eq!(request, ScriptRequest::new(ScriptKind::ResourceInventory));
        assert!(request.device_login);

        let request: ScriptRequest = serde_json::from_str(
            r#"{"kind":"inventory_report","device_login":false,"lite":true,"azure_environment":"AzureChinaCloud"}"#,
        )
        .unwrap();
        assert!(!request.device_login);
        assert!(request.lite);
        assert_eq!(request.azure_environment.as_deref(), Some("AzureChinaCloud"));
    }
}

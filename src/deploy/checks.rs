//! Structural checks over a parsed compose file.
//!
//! Every check pushes findings into a [`Report`] instead of failing fast, so
//! one run shows everything that is wrong with a descriptor.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::compose::{ComposeFile, PortMapping, Service};
use super::interpolate::{has_reference, interpolate};
use crate::config::DatabaseUrl;

const SECRET_MARKERS: [&str; 3] = ["TOKEN", "PASSWORD", "SECRET"];
const POSTGRES_DEFAULT_USER: &str = "postgres";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match &self.service {
            Some(service) => write!(f, "{level}[{service}]: {}", self.message),
            None => write!(f, "{level}: {}", self.message),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub findings: Vec<Finding>,
}

impl Report {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    fn error(&mut self, service: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Error, service, message.into());
    }

    fn warning(&mut self, service: Option<&str>, message: impl Into<String>) {
        self.push(Severity::Warning, service, message.into());
    }

    fn push(&mut self, severity: Severity, service: Option<&str>, message: String) {
        self.findings.push(Finding {
            severity,
            service: service.map(str::to_string),
            message,
        });
    }
}

/// Runs every check. `lookup` resolves variables from the deploying environment.
pub fn check<F>(compose: &ComposeFile, lookup: F) -> Report
where
    F: Fn(&str) -> Option<String>,
{
    let mut report = Report::default();
    let env = resolve_environments(compose, &lookup, &mut report);

    check_sources(compose, &mut report);
    check_restart_policies(compose, &mut report);
    check_dependencies(compose, &mut report);
    check_ports(compose, &mut report);
    check_volumes(compose, &mut report);
    check_database_urls(compose, &env, &mut report);
    check_literal_secrets(compose, &mut report);

    report
}

/// Asserts the descriptor declares exactly the named services.
pub fn expect_services(compose: &ComposeFile, expected: &[&str], report: &mut Report) {
    let declared: BTreeSet<&str> = compose.services.keys().map(String::as_str).collect();
    let wanted: BTreeSet<&str> = expected.iter().copied().collect();
    for missing in wanted.difference(&declared) {
        report.error(None, format!("expected service '{missing}' is not declared"));
    }
    for extra in declared.difference(&wanted) {
        report.error(Some(*extra), "service is not in the expected set");
    }
}

type ResolvedEnv = BTreeMap<String, BTreeMap<String, String>>;

fn resolve_environments<F>(compose: &ComposeFile, lookup: &F, report: &mut Report) -> ResolvedEnv
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = ResolvedEnv::new();
    for (name, service) in &compose.services {
        let vars = resolved.entry(name.clone()).or_default();
        for (key, raw) in service.environment.entries() {
            let value = match raw {
                Some(raw) => match interpolate(&raw, lookup) {
                    Ok(value) => value,
                    Err(e) => {
                        report.error(Some(name.as_str()), format!("environment {key}: {e}"));
                        continue;
                    }
                },
                None => match lookup(&key) {
                    Some(value) => value,
                    None => continue,
                },
            };
            vars.insert(key, value);
        }
    }
    resolved
}

fn check_sources(compose: &ComposeFile, report: &mut Report) {
    for (name, service) in &compose.services {
        if service.build.is_none() && service.image.is_none() {
            report.error(Some(name.as_str()), "service has neither build nor image");
        }
    }
}

fn check_restart_policies(compose: &ComposeFile, report: &mut Report) {
    for (name, service) in &compose.services {
        if let Err(e) = service.restart_policy() {
            report.error(Some(name.as_str()), e.to_string());
        }
    }
}

fn check_dependencies(compose: &ComposeFile, report: &mut Report) {
    for (name, service) in &compose.services {
        for dep in service.depends_on.names() {
            if dep == name.as_str() {
                report.error(Some(name.as_str()), "service depends on itself");
            } else if !compose.services.contains_key(dep) {
                report.error(Some(name.as_str()), format!("depends on undeclared service '{dep}'"));
            }
        }
    }

    if let Some(cycle) = find_cycle(compose) {
        report.error(None, format!("dependency cycle: {}", cycle.join(" -> ")));
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search over `depends_on`; returns the first cycle found.
fn find_cycle(compose: &ComposeFile) -> Option<Vec<String>> {
    fn visit<'a>(
        name: &'a str,
        compose: &'a ComposeFile,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(service) = compose.services.get(name) {
            for dep in service.depends_on.names() {
                // Self dependencies are reported on their own.
                if dep == name || !compose.services.contains_key(dep) {
                    continue;
                }
                if let Some(cycle) = visit(dep, compose, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    let mut path = Vec::new();
    compose
        .services
        .keys()
        .find_map(|name| visit(name, compose, &mut marks, &mut path))
}

fn check_ports(compose: &ComposeFile, report: &mut Report) {
    let mut bound: Vec<(&str, PortMapping)> = Vec::new();
    for (name, service) in &compose.services {
        for mapping in service.port_mappings() {
            match mapping {
                Ok(mapping) => bound.push((name.as_str(), mapping)),
                Err(e) => report.error(Some(name.as_str()), e.to_string()),
            }
        }
    }

    for (i, (first_service, first)) in bound.iter().enumerate() {
        let Some(first_host) = first.host else {
            continue;
        };
        for (second_service, second) in &bound[i + 1..] {
            let Some(second_host) = second.host else {
                continue;
            };
            let same_address = first.bind_address() == "*"
                || second.bind_address() == "*"
                || first.bind_address() == second.bind_address();
            if first.protocol == second.protocol && same_address && first_host.overlaps(&second_host)
            {
                report.error(
                    Some(*second_service),
                    format!(
                        "host port {}/{} is already bound by service '{}'",
                        second_host, second.protocol, first_service
                    ),
                );
            }
        }
    }
}

fn check_volumes(compose: &ComposeFile, report: &mut Report) {
    let mut mounted = BTreeSet::new();
    for (name, service) in &compose.services {
        for mount in service.volume_mounts() {
            match mount {
                Ok(mount) => {
                    if let Some(volume) = mount.named_volume() {
                        if !compose.volumes.contains_key(volume) {
                            report.error(
                                Some(name.as_str()),
                                format!("named volume '{volume}' is not declared at top level"),
                            );
                        }
                        mounted.insert(volume.to_string());
                    }
                }
                Err(e) => report.error(Some(name.as_str()), e.to_string()),
            }
        }
    }
    for volume in compose.volumes.keys() {
        if !mounted.contains(volume) {
            report.warning(None, format!("volume '{volume}' is declared but never mounted"));
        }
    }
}

fn check_database_urls(compose: &ComposeFile, env: &ResolvedEnv, report: &mut Report) {
    for (name, service) in &compose.services {
        let Some(raw) = env.get(name).and_then(|vars| vars.get("DATABASE_URL")) else {
            continue;
        };
        let url = match DatabaseUrl::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                report.error(Some(name.as_str()), format!("DATABASE_URL: {e}"));
                continue;
            }
        };
        let Some(target) = compose.services.get(&url.host) else {
            // Points outside this deployment.
            continue;
        };
        if &url.host != name && !service.depends_on.contains(&url.host) {
            report.error(
                Some(name.as_str()),
                format!(
                    "DATABASE_URL points at service '{}' which is not in depends_on",
                    url.host
                ),
            );
        }
        let empty = BTreeMap::new();
        let target_env = env.get(&url.host).unwrap_or(&empty);
        compare_with_postgres(name, &url, target, target_env, report);
    }
}

fn compare_with_postgres(
    name: &str,
    url: &DatabaseUrl,
    target: &Service,
    target_env: &BTreeMap<String, String>,
    report: &mut Report,
) {
    let looks_like_postgres = target
        .image
        .as_deref()
        .map(|image| image.starts_with("postgres"))
        .unwrap_or(false)
        || target_env.keys().any(|k| k.starts_with("POSTGRES_"));
    if !looks_like_postgres {
        return;
    }

    let user = target_env
        .get("POSTGRES_USER")
        .map(String::as_str)
        .unwrap_or(POSTGRES_DEFAULT_USER);
    let database = target_env
        .get("POSTGRES_DB")
        .map(String::as_str)
        .unwrap_or(user);

    if url.user != user {
        report.error(
            Some(name),
            format!(
                "DATABASE_URL user '{}' does not match POSTGRES_USER '{}' on '{}'",
                url.user, user, url.host
            ),
        );
    }
    if let Some(password) = target_env.get("POSTGRES_PASSWORD") {
        if url.password.as_deref() != Some(password.as_str()) {
            report.error(
                Some(name),
                format!(
                    "DATABASE_URL password does not match POSTGRES_PASSWORD on '{}'",
                    url.host
                ),
            );
        }
    }
    if url.database != database {
        report.error(
            Some(name),
            format!(
                "DATABASE_URL database '{}' does not match POSTGRES_DB '{}' on '{}'",
                url.database, database, url.host
            ),
        );
    }

    let listens = url.port == DatabaseUrl::DEFAULT_PORT
        || target
            .port_mappings()
            .into_iter()
            .flatten()
            .any(|m| m.container.contains(url.port));
    if !listens {
        report.error(
            Some(name),
            format!(
                "DATABASE_URL port {} is not a port '{}' listens on",
                url.port, url.host
            ),
        );
    }
}

fn check_literal_secrets(compose: &ComposeFile, report: &mut Report) {
    for (name, service) in &compose.services {
        for (key, raw) in service.environment.entries() {
            let Some(raw) = raw else {
                continue;
            };
            let upper = key.to_ascii_uppercase();
            let secret = SECRET_MARKERS.iter().any(|marker| upper.contains(marker));
            if secret && !raw.is_empty() && !has_reference(&raw) {
                report.warning(
                    Some(name.as_str()),
                    format!("{key} holds a literal secret; pass it in as ${{{key}}} instead"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn errors(report: &Report) -> Vec<String> {
        report.errors().map(|f| f.message.clone()).collect()
    }

    #[test]
    fn test_consistent_descriptor_has_no_errors() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  app:
    build: .
    depends_on: [pg]
    environment:
      DATABASE_URL: postgresql://shop:${PG_PASSWORD}@pg:5432/shop
    ports: ["8080:80"]
  pg:
    image: postgres:16
    environment:
      POSTGRES_USER: shop
      POSTGRES_PASSWORD: ${PG_PASSWORD}
    volumes: ["pgdata:/var/lib/postgresql/data"]
volumes:
  pgdata:
"#,
        )
        .unwrap();
        let report = check(&compose, |key| {
            (key == "PG_PASSWORD").then(|| "hunter2".to_string())
        });
        assert!(!report.has_errors(), "{:?}", report.findings);
        assert_eq!(report.warnings().count(), 0);
    }

    #[test]
    fn test_database_url_mismatches() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  app:
    build: .
    environment:
      DATABASE_URL: postgresql://app:pw@pg:6543/other
  pg:
    image: postgres
    environment:
      POSTGRES_PASSWORD: secret
"#,
        )
        .unwrap();
        let errs = errors(&check(&compose, no_env));
        assert!(errs.iter().any(|e| e.contains("not in depends_on")));
        assert!(errs.iter().any(|e| e.contains("user 'app'")));
        assert!(errs.iter().any(|e| e.contains("password does not match")));
        assert!(errs.iter().any(|e| e.contains("database 'other'")));
        assert!(errs.iter().any(|e| e.contains("port 6543")));
    }

    #[test]
    fn test_unparseable_database_url() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  app:
    image: app
    environment:
      DATABASE_URL: mysql://db/app
"#,
        )
        .unwrap();
        let errs = errors(&check(&compose, no_env));
        assert!(errs[0].starts_with("DATABASE_URL:"));
    }

    #[test]
    fn test_dependency_errors() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  a:
    image: a
    depends_on: [b]
  b:
    image: b
    depends_on: [a, ghost]
  c:
    image: c
    depends_on: [c]
"#,
        )
        .unwrap();
        let errs = errors(&check(&compose, no_env));
        assert!(errs.iter().any(|e| e.contains("undeclared service 'ghost'")));
        assert!(errs.iter().any(|e| e == "service depends on itself"));
        assert!(errs.iter().any(|e| e == "dependency cycle: a -> b -> a"));
    }

    #[test]
    fn test_port_conflicts_respect_address_and_protocol() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  a:
    image: a
    ports: ["8000:80", "127.0.0.1:9000:90", "53:53/udp"]
  b:
    image: b
    ports: ["8000:81", "127.0.0.2:9000:90", "53:53/tcp", "bogus"]
"#,
        )
        .unwrap();
        let report = check(&compose, no_env);
        let errs = errors(&report);
        assert_eq!(errs.len(), 2, "{errs:?}");
        assert!(errs.iter().any(|e| e.contains("host port 8000/tcp")));
        assert!(errs.iter().any(|e| e.contains("invalid port mapping 'bogus'")));
    }

    #[test]
    fn test_volume_declarations() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  a:
    image: a
    volumes: ["undeclared:/data", "./local:/srv"]
volumes:
  unused:
"#,
        )
        .unwrap();
        let report = check(&compose, no_env);
        assert!(errors(&report)[0].contains("'undeclared' is not declared"));
        let warnings: Vec<_> = report.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("'unused'"));
    }

    #[test]
    fn test_missing_source_and_bad_restart() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  a:
    restart: sometimes
"#,
        )
        .unwrap();
        let errs = errors(&check(&compose, no_env));
        assert!(errs.iter().any(|e| e.contains("neither build nor image")));
        assert!(errs.iter().any(|e| e.contains("invalid restart policy")));
    }

    #[test]
    fn test_literal_secrets_warn() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  a:
    image: a
    environment:
      API_TOKEN: abc
      DB_PASSWORD: ${DB_PASSWORD}
      client_secret: xyz
      PUBLIC: plain
"#,
        )
        .unwrap();
        let report = check(&compose, no_env);
        let warned: Vec<&str> = report
            .warnings()
            .map(|f| f.message.split(' ').next().unwrap_or(""))
            .collect();
        assert_eq!(warned, vec!["API_TOKEN", "client_secret"]);
    }

    #[test]
    fn test_expect_services() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  web:
    build: .
  worker:
    build: .
"#,
        )
        .unwrap();
        let mut report = Report::default();
        expect_services(&compose, &["web", "db"], &mut report);
        let errs = errors(&report);
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("'db'"));
    }

    #[test]
    fn test_interpolation_failure_is_reported() {
        let compose = ComposeFile::from_yaml_str(
            r#"
services:
  a:
    image: a
    environment:
      ADMIN_TOKEN: ${ADMIN_TOKEN:?admin token required}
"#,
        )
        .unwrap();
        let report = check(&compose, no_env);
        assert!(errors(&report)[0].contains("admin token required"));
    }
}

//! Ansible INI inventory rendering and parsing

use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum InventoryError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("host {host} not found in group [{group}]")]
    MissingHost { group: String, host: String },

    #[error("host {host} has ansible_host={found:?}, expected {expected}")]
    WrongAddress {
        host: String,
        expected: IpAddr,
        found: Option<String>,
    },
}

/// Host entry of an inventory group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryHost {
    pub name: String,
    pub vars: BTreeMap<String, String>,
}

/// Parsed INI inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    groups: BTreeMap<String, Vec<InventoryHost>>,
    group_vars: BTreeMap<String, BTreeMap<String, String>>,
    children: BTreeMap<String, Vec<String>>,
}

enum Section {
    Hosts(String),
    Vars(String),
    Children(String),
}

impl Inventory {
    /// Render the single-host inventory used for a join run
    pub fn render(tag: &str, hostname: &str, address: IpAddr, user: &str) -> String {
        format!(
            "[{}]\n{} ansible_host={} ansible_port=22 ansible_user={}\n",
            tag.trim(),
            hostname,
            address,
            user
        )
    }

    pub fn parse(input: &str) -> Result<Self, InventoryError> {
        let mut inventory = Inventory::default();
        // Hosts before any header belong to the implicit `ungrouped` group
        let mut section = Section::Hosts("ungrouped".to_string());

        for (idx, raw) in input.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let header = line
                    .strip_prefix('[')
                    .and_then(|l| l.strip_suffix(']'))
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| InventoryError::Parse {
                        line: line_no,
                        message: format!("malformed section header {:?}", line),
                    })?;

                section = match header.split_once(':') {
                    None => {
                        inventory.groups.entry(header.to_string()).or_default();
                        Section::Hosts(header.to_string())
                    }
                    Some((group, "vars")) => Section::Vars(group.to_string()),
                    Some((group, "children")) => Section::Children(group.to_string()),
                    Some((_, other)) => {
                        return Err(InventoryError::Parse {
                            line: line_no,
                            message: format!("unknown section type :{}", other),
                        })
                    }
                };
                continue;
            }

            match &section {
                Section::Hosts(group) => {
                    let host = parse_host_line(line, line_no)?;
                    inventory.groups.entry(group.clone()).or_default().push(host);
                }
                Section::Vars(group) => {
                    let (key, value) = parse_pair(line, line_no)?;
                    inventory
                        .group_vars
                        .entry(group.clone())
                        .or_default()
                        .insert(key, value);
                }
                Section::Children(group) => {
                    inventory
                        .children
                        .entry(group.clone())
                        .or_default()
                        .push(line.to_string());
                }
            }
        }

        Ok(inventory)
    }

    pub fn group(&self, name: &str) -> Option<&[InventoryHost]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn group_vars(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.group_vars.get(name)
    }

    pub fn children(&self, name: &str) -> Option<&[String]> {
        self.children.get(name).map(Vec::as_slice)
    }

    /// Check `host` is listed under `group` with the expected `ansible_host`
    pub fn validate_host(&self, group: &str, host: &str, address: IpAddr) -> Result<(), InventoryError> {
        let entry = self
            .group(group)
            .and_then(|hosts| hosts.iter().find(|h| h.name == host))
            .ok_or_else(|| InventoryError::MissingHost {
                group: group.to_string(),
                host: host.to_string(),
            })?;

        let found = entry.vars.get("ansible_host");
        if found.and_then(|a| a.parse::<IpAddr>().ok()) != Some(address) {
            return Err(InventoryError::WrongAddress {
                host: host.to_string(),
                expected: address,
                found: found.cloned(),
            });
        }
        Ok(())
    }
}

fn parse_host_line(line: &str, line_no: usize) -> Result<InventoryHost, InventoryError> {
    let mut tokens = line.split_whitespace();
    let name = tokens.next().unwrap_or_default();
    if name.contains('=') {
        return Err(InventoryError::Parse {
            line: line_no,
            message: format!("expected a host name, got {:?}", name),
        });
    }

    let vars = tokens
        .map(|token| parse_pair(token, line_no))
        .collect::<Result<_, _>>()?;

    Ok(InventoryHost {
        name: name.to_string(),
        vars,
    })
}

fn parse_pair(token: &str, line_no: usize) -> Result<(String, String), InventoryError> {
    match token.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(InventoryError::Parse {
            line: line_no,
            message: format!("expected key=value, got {:?}", token),
        }),
    }
}

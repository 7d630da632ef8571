//! Capability descriptors and the registry the resolver iterates.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::resolver::AvailabilityMap;

/// Static declaration of one administrative feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityDescriptor {
    id: String,
    display_name: String,
    category: String,
    required_modules: Vec<String>,
    required_scopes: Vec<String>,
}

impl CapabilityDescriptor {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            category: category.into(),
            required_modules: Vec::new(),
            required_scopes: Vec::new(),
        }
    }

    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn required_modules(&self) -> &[String] {
        &self.required_modules
    }

    pub fn required_scopes(&self) -> &[String] {
        &self.required_scopes
    }

    /// Usable when every required module is marked installed.
    pub fn is_available(&self, modules: &AvailabilityMap) -> bool {
        self.required_modules
            .iter()
            .all(|m| modules.is_installed(m))
    }

    /// Required modules the map reports as absent (or does not know about).
    pub fn missing_modules<'a>(&'a self, modules: &AvailabilityMap) -> Vec<&'a str> {
        self.required_modules
            .iter()
            .filter(|m| !modules.is_installed(m))
            .map(String::as_str)
            .collect()
    }
}

/// Supplies the descriptors registered at startup.
pub trait CapabilityProvider {
    fn capabilities(&self) -> &[CapabilityDescriptor];
}

impl CapabilityProvider for [CapabilityDescriptor] {
    fn capabilities(&self) -> &[CapabilityDescriptor] {
        self
    }
}

impl CapabilityProvider for Vec<CapabilityDescriptor> {
    fn capabilities(&self) -> &[CapabilityDescriptor] {
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: Vec<CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor; a later registration with the same id replaces the earlier one.
    pub fn register(&mut self, descriptor: CapabilityDescriptor) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|d| d.id.eq_ignore_ascii_case(&descriptor.id))
        {
            *existing = descriptor;
        } else {
            self.entries.push(descriptor);
        }
    }

    pub fn get(&self, id: &str) -> Option<&CapabilityDescriptor> {
        self.entries.iter().find(|d| d.id.eq_ignore_ascii_case(id))
    }

    pub fn by_category(&self) -> BTreeMap<&str, Vec<&CapabilityDescriptor>> {
        let mut groups: BTreeMap<&str, Vec<&CapabilityDescriptor>> = BTreeMap::new();
        for d in &self.entries {
            groups.entry(d.category.as_str()).or_default().push(d);
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The capabilities shipped with the console.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(
            CapabilityDescriptor::new("mailboxes", "Mailboxes", "Exchange")
                .with_modules(["ExchangeOnlineManagement"])
                .with_scopes(["Exchange.ManageAsApp"]),
        );
        reg.register(
            CapabilityDescriptor::new("distribution-groups", "Distribution Groups", "Exchange")
                .with_modules(["ExchangeOnlineManagement"])
                .with_scopes(["Exchange.ManageAsApp"]),
        );
        reg.register(
            CapabilityDescriptor::new("mail-flow", "Mail Flow Rules", "Exchange")
                .with_modules(["ExchangeOnlineManagement"])
                .with_scopes(["Exchange.ManageAsApp"]),
        );
        reg.register(
            CapabilityDescriptor::new("users", "Users", "Directory")
                .with_modules(["Microsoft.Graph.Users", "Microsoft.Graph.Authentication"])
                .with_scopes(["User.Read.All"]),
        );
        reg.register(
            CapabilityDescriptor::new("groups", "Groups", "Directory")
                .with_modules(["Microsoft.Graph.Groups", "Microsoft.Graph.Authentication"])
                .with_scopes(["Group.Read.All"]),
        );
        reg.register(
            CapabilityDescriptor::new("teams", "Teams", "Collaboration")
                .with_modules(["MicrosoftTeams"])
                .with_scopes(["Team.ReadBasic.All"]),
        );
        reg.register(
            CapabilityDescriptor::new("sites", "SharePoint Sites", "Collaboration")
                .with_modules(["PnP.PowerShell"])
                .with_scopes(["Sites.Read.All"]),
        );
        reg
    }
}

impl CapabilityProvider for CapabilityRegistry {
    fn capabilities(&self) -> &[CapabilityDescriptor] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_same_id() {
        let mut reg = CapabilityRegistry::new();
        reg.register(CapabilityDescriptor::new("users", "Users", "Directory"));
        reg.register(
            CapabilityDescriptor::new("USERS", "Users v2", "Directory").with_modules(["M1"]),
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("users").unwrap().display_name(), "Users v2");
    }

    #[test]
    fn availability_requires_every_module() {
        let cap = CapabilityDescriptor::new("a", "A", "X").with_modules(["M1", "M2"]);
        let mut map = AvailabilityMap::new();
        map.insert("m1", true);
        map.insert("M2", false);
        assert!(!cap.is_available(&map));
        assert_eq!(cap.missing_modules(&map), vec!["M2"]);
        map.insert("m2", true);
        assert!(cap.is_available(&map));
    }

    #[test]
    fn builtin_groups_by_category() {
        let reg = CapabilityRegistry::builtin();
        let groups = reg.by_category();
        assert!(groups.contains_key("Exchange"));
        assert!(groups["Exchange"].len() >= 2);
        assert!(reg
            .capabilities()
            .iter()
            .all(|c| !c.required_modules().is_empty()));
    }
}

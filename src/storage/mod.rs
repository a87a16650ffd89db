//! Repository seams over the relational store. The core issues one
//! logical read and one write per recorded request; everything else
//! about persistence is the caller's concern.

mod postgres;

pub use postgres::{PgAccountRepository, PgOrganizationRepository};

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{Account, Organization, Result};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn accounts_for_org(&self, organization_id: &str) -> Result<Vec<Account>>;

    async fn get(&self, account_id: &str) -> Result<Option<Account>>;

    /// Persist health counters, circuit state, and monthly usage
    async fn update(&self, account: &Account) -> Result<()>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    async fn get(&self, organization_id: &str) -> Result<Option<Organization>>;
}

/// In-memory account repository for tests and downstream harnesses
#[derive(Default)]
pub struct InMemoryAccountRepository {
    accounts: Mutex<HashMap<String, Account>>,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.id.clone(), account);
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn accounts_for_org(&self, organization_id: &str) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn get(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.lock().unwrap().get(account_id).cloned())
    }

    async fn update(&self, account: &Account) -> Result<()> {
        self.accounts
            .lock()
            .unwrap()
            .insert(account.id.clone(), account.clone());
        Ok(())
    }
}

/// In-memory organization repository for tests
#[derive(Default)]
pub struct InMemoryOrganizationRepository {
    organizations: Mutex<HashMap<String, Organization>>,
}

impl InMemoryOrganizationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, organization: Organization) {
        self.organizations
            .lock()
            .unwrap()
            .insert(organization.id.clone(), organization);
    }
}

#[async_trait]
impl OrganizationRepository for InMemoryOrganizationRepository {
    async fn get(&self, organization_id: &str) -> Result<Option<Organization>> {
        Ok(self
            .organizations
            .lock()
            .unwrap()
            .get(organization_id)
            .cloned())
    }
}

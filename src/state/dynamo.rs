//! DynamoDB implementation of [`ItemTable`].

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::DisplayErrorContext;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, GlobalSecondaryIndex, IndexStatus,
    KeySchemaElement, KeyType, Projection, ProjectionType, ScalarAttributeType, TableStatus,
};
use aws_sdk_dynamodb::Client;

use super::error::StateError;
use super::kv::{Index, Item, ItemTable, Table};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Table creation and deletion normally settle within a minute.
const MAX_POLLS: u32 = 150;

/// A table-set named `<name>-packages` / `<name>-repositories`, with
/// pay-per-request billing and two all-projection indexes on packages.
pub struct DynamoTable {
    client: Client,
    name: String,
}

impl std::fmt::Debug for DynamoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoTable")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn key_element(attr: &str, key_type: KeyType) -> Result<KeySchemaElement, StateError> {
    KeySchemaElement::builder()
        .attribute_name(attr)
        .key_type(key_type)
        .build()
        .map_err(|e| StateError::query("create_table", e))
}

fn string_attribute(attr: &str) -> Result<AttributeDefinition, StateError> {
    AttributeDefinition::builder()
        .attribute_name(attr)
        .attribute_type(ScalarAttributeType::S)
        .build()
        .map_err(|e| StateError::query("create_table", e))
}

impl DynamoTable {
    pub fn new(client: Client, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
        }
    }

    fn table_name(&self, table: Table) -> String {
        format!("{}-{}", self.name, table.suffix())
    }

    fn index_name(&self, index: Index) -> String {
        format!("{}-{}-{}", self.name, Table::Packages.suffix(), index.suffix())
    }

    /// `None` when the table doesn't exist, otherwise whether the table and
    /// all of its indexes are active.
    async fn table_ready(&self, name: &str) -> Result<Option<bool>, StateError> {
        match self.client.describe_table().table_name(name).send().await {
            Ok(out) => Ok(Some(out.table().is_some_and(|t| {
                t.table_status() == Some(&TableStatus::Active)
                    && t
                        .global_secondary_indexes()
                        .iter()
                        .all(|i| i.index_status() == Some(&IndexStatus::Active))
            }))),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_resource_not_found_exception()) =>
            {
                Ok(None)
            }
            Err(e) => Err(StateError::query("describe_table", DisplayErrorContext(&e))),
        }
    }

    async fn wait_for(
        &self,
        name: &str,
        operation: &'static str,
        done: impl Fn(Option<bool>) -> bool,
    ) -> Result<(), StateError> {
        for _ in 0..MAX_POLLS {
            if done(self.table_ready(name).await?) {
                return Ok(());
            }
            tracing::debug!(table = %name, "Waiting for table to settle");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(StateError::query(
            operation,
            format!("table {} did not settle in time", name),
        ))
    }

    async fn create_table(&self, table: Table) -> Result<(), StateError> {
        let name = self.table_name(table);
        let key = table.key_attribute();
        let mut request = self
            .client
            .create_table()
            .table_name(&name)
            .billing_mode(BillingMode::PayPerRequest)
            .attribute_definitions(string_attribute(key)?)
            .key_schema(key_element(key, KeyType::Hash)?);

        if table == Table::Packages {
            let mut defined: Vec<&str> = Vec::new();
            for index in Index::ALL {
                for attr in [index.hash_attribute(), index.range_attribute()] {
                    if !defined.contains(&attr) {
                        request = request.attribute_definitions(string_attribute(attr)?);
                        defined.push(attr);
                    }
                }
                let gsi = GlobalSecondaryIndex::builder()
                    .index_name(self.index_name(index))
                    .key_schema(key_element(index.hash_attribute(), KeyType::Hash)?)
                    .key_schema(key_element(index.range_attribute(), KeyType::Range)?)
                    .projection(
                        Projection::builder()
                            .projection_type(ProjectionType::All)
                            .build(),
                    )
                    .build()
                    .map_err(|e| StateError::query("create_table", e))?;
                request = request.global_secondary_indexes(gsi);
            }
        }

        match request.send().await {
            Ok(_) => {
                tracing::info!(table = %name, "Created state table");
                Ok(())
            }
            // Another process created it first
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_resource_in_use_exception()) =>
            {
                Ok(())
            }
            Err(e) => Err(StateError::query("create_table", DisplayErrorContext(&e))),
        }
    }
}

#[async_trait]
impl ItemTable for DynamoTable {
    async fn ensure_tables(&self) -> Result<(), StateError> {
        for table in [Table::Packages, Table::Repositories] {
            let name = self.table_name(table);
            if self.table_ready(&name).await?.is_none() {
                self.create_table(table).await?;
            }
            self.wait_for(&name, "ensure_tables", |ready| ready == Some(true))
                .await?;
        }
        Ok(())
    }

    async fn drop_tables(&self) -> Result<(), StateError> {
        for table in [Table::Packages, Table::Repositories] {
            let name = self.table_name(table);
            match self.client.delete_table().table_name(&name).send().await {
                Ok(_) => tracing::info!(table = %name, "Deleted state table"),
                Err(e)
                    if e
                        .as_service_error()
                        .is_some_and(|se| se.is_resource_not_found_exception()) => {}
                Err(e) => {
                    return Err(StateError::query("drop_tables", DisplayErrorContext(&e)))
                }
            }
            self.wait_for(&name, "drop_tables", |ready| ready.is_none())
                .await?;
        }
        Ok(())
    }

    async fn get_item(&self, table: Table, key: &str) -> Result<Option<Item>, StateError> {
        let out = self
            .client
            .get_item()
            .table_name(self.table_name(table))
            .key(table.key_attribute(), AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StateError::query("get_item", DisplayErrorContext(&e)))?;
        Ok(out.item().cloned())
    }

    async fn put_if_absent(&self, table: Table, item: Item) -> Result<bool, StateError> {
        let result = self
            .client
            .put_item()
            .table_name(self.table_name(table))
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(#k)")
            .expression_attribute_names("#k", table.key_attribute())
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(StateError::query("put_item", DisplayErrorContext(&e))),
        }
    }

    async fn update_existing(
        &self,
        table: Table,
        key: &str,
        set: Item,
        remove: &[&str],
    ) -> Result<bool, StateError> {
        let mut request = self
            .client
            .update_item()
            .table_name(self.table_name(table))
            .key(table.key_attribute(), AttributeValue::S(key.to_string()))
            .condition_expression("attribute_exists(#k)")
            .expression_attribute_names("#k", table.key_attribute());

        let mut clauses = Vec::new();
        let mut assignments = Vec::new();
        for (i, (attr, value)) in set.into_iter().enumerate() {
            let (name, placeholder) = (format!("#s{}", i), format!(":s{}", i));
            assignments.push(format!("{} = {}", name, placeholder));
            request = request
                .expression_attribute_names(name, attr)
                .expression_attribute_values(placeholder, value);
        }
        if !assignments.is_empty() {
            clauses.push(format!("SET {}", assignments.join(", ")));
        }
        let mut removals = Vec::new();
        for (i, attr) in remove.iter().enumerate() {
            let name = format!("#r{}", i);
            removals.push(name.clone());
            request = request.expression_attribute_names(name, *attr);
        }
        if !removals.is_empty() {
            clauses.push(format!("REMOVE {}", removals.join(", ")));
        }
        if clauses.is_empty() {
            return Ok(self.get_item(table, key).await?.is_some());
        }

        match request.update_expression(clauses.join(" ")).send().await {
            Ok(_) => Ok(true),
            Err(e)
                if e
                    .as_service_error()
                    .is_some_and(|se| se.is_conditional_check_failed_exception()) =>
            {
                Ok(false)
            }
            Err(e) => Err(StateError::query("update_item", DisplayErrorContext(&e))),
        }
    }

    async fn query_index(&self, index: Index, hash_value: &str) -> Result<Vec<Item>, StateError> {
        let mut items = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let out = self
                .client
                .query()
                .table_name(self.table_name(Table::Packages))
                .index_name(self.index_name(index))
                .key_condition_expression("#h = :h")
                .expression_attribute_names("#h", index.hash_attribute())
                .expression_attribute_values(":h", AttributeValue::S(hash_value.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| StateError::query("query", DisplayErrorContext(&e)))?;
            items.extend(out.items().iter().cloned());
            match out.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }
}

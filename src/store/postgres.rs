use async_trait::async_trait;
use sqlx::PgPool;

use super::Store;
use crate::models::{Api, Bind, ServiceInstance, Subscription};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    // -- Service Instance Operations --

    async fn insert_instance(&self, instance: &ServiceInstance) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO service_instances (id, application_id, application_name, org_id, space_id, consumer_key, consumer_secret, parameter_hash)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(&instance.id)
        .bind(&instance.application_id)
        .bind(&instance.application_name)
        .bind(&instance.org_id)
        .bind(&instance.space_id)
        .bind(&instance.consumer_key)
        .bind(&instance.consumer_secret)
        .bind(&instance.parameter_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> anyhow::Result<Option<ServiceInstance>> {
        let row = sqlx::query_as::<_, ServiceInstance>(
            "SELECT id, application_id, application_name, org_id, space_id, consumer_key, consumer_secret, parameter_hash FROM service_instances WHERE id = $1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_instance_hash(&self, instance_id: &str, parameter_hash: &str) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE service_instances SET parameter_hash = $2 WHERE id = $1")
            .bind(instance_id)
            .bind(parameter_hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("service instance {} does not exist", instance_id);
        }
        Ok(())
    }

    /// Subscriptions and binds go with it (`ON DELETE CASCADE`).
    async fn delete_instance(&self, instance_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM service_instances WHERE id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Subscription Operations --

    async fn insert_subscriptions(&self, subscriptions: &[Subscription]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for sub in subscriptions {
            sqlx::query(
                r#"INSERT INTO subscriptions (id, application_id, api_name, api_version, "user", instance_id)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(&sub.id)
            .bind(&sub.application_id)
            .bind(&sub.api_name)
            .bind(&sub.api_version)
            .bind(&sub.user)
            .bind(&sub.instance_id)
            .execute(&mut *tx)
            .await?;
        }
        // Dropping `tx` on an early return rolls the batch back.
        tx.commit().await?;
        Ok(())
    }

    async fn list_subscriptions(&self, instance_id: &str) -> anyhow::Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, Subscription>(
            r#"SELECT id, application_id, api_name, api_version, "user", instance_id FROM subscriptions WHERE instance_id = $1 ORDER BY id ASC"#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_subscription(
        &self,
        application_id: &str,
        api: &Api,
    ) -> anyhow::Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, Subscription>(
            r#"SELECT id, application_id, api_name, api_version, "user", instance_id FROM subscriptions
               WHERE application_id = $1 AND api_name = $2 AND api_version = $3"#,
        )
        .bind(application_id)
        .bind(&api.name)
        .bind(&api.version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_subscription(&self, subscription_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Bind Operations --

    async fn insert_bind(&self, bind: &Bind) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO binds (id, instance_id, platform_app_id) VALUES ($1, $2, $3)")
            .bind(&bind.id)
            .bind(&bind.instance_id)
            .bind(&bind.platform_app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_bind(&self, bind_id: &str) -> anyhow::Result<Option<Bind>> {
        let row = sqlx::query_as::<_, Bind>(
            "SELECT id, instance_id, platform_app_id FROM binds WHERE id = $1",
        )
        .bind(bind_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_bind(&self, bind_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM binds WHERE id = $1")
            .bind(bind_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

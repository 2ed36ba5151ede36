//! Postgres-backed `DataStore` implementation.
//!
//! Query style follows the `mvirt-net`/`mvirt-zfs` stores: runtime
//! `sqlx::query(...)` + `.bind()` + manual `Row::get` extraction, generalized
//! from SQLite to Postgres placeholders and JSONB columns (§10.1).

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::domain::{
    Image, ImageLifecycle, ImportSource, LifecycleKind, PlacementEntry, RuntimeState,
    SecurityGroup, SecurityGroupRule, Slice, Vm, Zone,
};

use super::error::{Result, StoreError};
use super::traits::{ImageStore, PlacementStore, SecurityGroupStore, SliceStore, VncStore};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::DependencyUnavailable(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("migration failed: {e}")))
    }

    #[cfg(test)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn lifecycle_to_str(kind: LifecycleKind) -> &'static str {
    match kind {
        LifecycleKind::Validated => "validated",
        LifecycleKind::VlansMapped => "vlans_mapped",
        LifecycleKind::Deployed => "deployed",
        LifecycleKind::Error => "error",
        LifecycleKind::Deleted => "deleted",
    }
}

fn lifecycle_from_str(raw: &str) -> Result<LifecycleKind> {
    match raw {
        "validated" => Ok(LifecycleKind::Validated),
        "vlans_mapped" => Ok(LifecycleKind::VlansMapped),
        "deployed" => Ok(LifecycleKind::Deployed),
        "error" => Ok(LifecycleKind::Error),
        "deleted" => Ok(LifecycleKind::Deleted),
        other => Err(StoreError::Internal(format!("unknown lifecycle_kind in row: {other}"))),
    }
}

fn runtime_to_str(state: Option<RuntimeState>) -> &'static str {
    match state {
        None => "",
        Some(RuntimeState::Corriendo) => "corriendo",
        Some(RuntimeState::Pausado) => "pausado",
        Some(RuntimeState::Apagado) => "apagado",
        Some(RuntimeState::Eliminado) => "eliminado",
    }
}

fn runtime_from_str(raw: Option<&str>) -> Option<RuntimeState> {
    match raw {
        Some("corriendo") => Some(RuntimeState::Corriendo),
        Some("pausado") => Some(RuntimeState::Pausado),
        Some("apagado") => Some(RuntimeState::Apagado),
        Some("eliminado") => Some(RuntimeState::Eliminado),
        _ => None,
    }
}

fn vlans_to_string(vlans: &[u32]) -> String {
    vlans.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn vlans_from_string(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

fn row_to_slice(row: &sqlx::postgres::PgRow) -> Result<Slice> {
    let raw_kind: String = row.try_get("tipo").map_err(sqlx_err)?;
    let raw_state: Option<String> = row.try_get("estado").map_err(sqlx_err)?;
    let vlans_raw: String = row.try_get("vlans").map_err(sqlx_err)?;
    let vms_json: serde_json::Value = row.try_get("vms").map_err(sqlx_err)?;

    Ok(Slice {
        id: row.try_get("id").map_err(sqlx_err)?,
        owner_user_id: row.try_get("usuario").map_err(sqlx_err)?,
        name: row.try_get("nombre_slice").map_err(sqlx_err)?,
        zone: row
            .try_get::<String, _>("zona")
            .map_err(sqlx_err)?
            .parse()
            .map_err(StoreError::Internal)?,
        lifecycle_kind: lifecycle_from_str(&raw_kind)?,
        runtime_state: runtime_from_str(raw_state.as_deref()),
        request_json: row.try_get("peticion_json").map_err(sqlx_err)?,
        vlans: vlans_from_string(&vlans_raw),
        vms: serde_json::from_value(vms_json).map_err(|e| StoreError::Internal(e.to_string()))?,
        created_at: row.try_get("timestamp_creacion").map_err(sqlx_err)?,
        deployed_at: row.try_get("timestamp_despliegue").map_err(sqlx_err)?,
    })
}

fn sqlx_err(e: sqlx::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

#[async_trait]
impl SliceStore for PostgresStore {
    async fn create_slice(
        &self,
        owner_user_id: &str,
        name: &str,
        zone: Zone,
        request_json: serde_json::Value,
    ) -> Result<Slice> {
        let row = sqlx::query(
            r#"
            INSERT INTO slices (usuario, nombre_slice, zona, tipo, estado, vlans, peticion_json, vms)
            VALUES ($1, $2, $3, 'validated', NULL, '', $4, '[]')
            RETURNING id, usuario, nombre_slice, zona, tipo, estado, vlans, peticion_json, vms,
                      timestamp_creacion, timestamp_despliegue
            "#,
        )
        .bind(owner_user_id)
        .bind(name)
        .bind(zone.as_str())
        .bind(&request_json)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        row_to_slice(&row)
    }

    async fn get_slice(&self, id: i64) -> Result<Slice> {
        let row = sqlx::query(
            r#"SELECT id, usuario, nombre_slice, zona, tipo, estado, vlans, peticion_json, vms,
                      timestamp_creacion, timestamp_despliegue
               FROM slices WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?
        .ok_or_else(|| StoreError::NotFound(format!("slice {id} not found")))?;

        row_to_slice(&row)
    }

    async fn list_slices(&self, owner_user_id: Option<&str>) -> Result<Vec<Slice>> {
        let rows = match owner_user_id {
            Some(uid) => {
                sqlx::query(
                    r#"SELECT id, usuario, nombre_slice, zona, tipo, estado, vlans, peticion_json, vms,
                              timestamp_creacion, timestamp_despliegue
                       FROM slices WHERE usuario = $1 ORDER BY id"#,
                )
                .bind(uid)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"SELECT id, usuario, nombre_slice, zona, tipo, estado, vlans, peticion_json, vms,
                              timestamp_creacion, timestamp_despliegue
                       FROM slices ORDER BY id"#,
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(sqlx_err)?;

        rows.iter().map(row_to_slice).collect()
    }

    async fn plan_vlans(&self, slice_id: i64, zone: Zone, link_count: usize) -> Result<Vec<u32>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        // Zone-scoped mutex: a session-level advisory lock keyed by the
        // zone name, held for the lifetime of this transaction (§4.2,
        // §5 "a zone-scoped mutex").
        let zone_key = zone_lock_key(zone);
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(zone_key)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        let rows = sqlx::query(
            "SELECT vlans FROM slices WHERE zona = $1 AND tipo IN ('validated', 'deployed', 'vlans_mapped')",
        )
        .bind(zone.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        let mut occupied = std::collections::BTreeSet::new();
        for row in &rows {
            let raw: String = row.try_get("vlans").map_err(sqlx_err)?;
            occupied.extend(vlans_from_string(&raw));
        }

        let allocated = crate::planner::allocate_vlans(zone, &occupied, link_count)?;

        sqlx::query("UPDATE slices SET vlans = $1 WHERE id = $2")
            .bind(vlans_to_string(&allocated))
            .bind(slice_id)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;
        Ok(allocated)
    }

    async fn apply_vlan_mapping(
        &self,
        slice_id: i64,
        request_json: serde_json::Value,
        vms: Vec<Vm>,
    ) -> Result<()> {
        let vms_json = serde_json::to_value(&vms).map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query("UPDATE slices SET peticion_json = $1, vms = $2, tipo = 'vlans_mapped' WHERE id = $3")
            .bind(&request_json)
            .bind(&vms_json)
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn set_lifecycle_kind(&self, slice_id: i64, kind: LifecycleKind) -> Result<()> {
        sqlx::query("UPDATE slices SET tipo = $1 WHERE id = $2")
            .bind(lifecycle_to_str(kind))
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn mark_deployed(&self, slice_id: i64, vms: Vec<Vm>) -> Result<()> {
        let vms_json = serde_json::to_value(&vms).map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query(
            "UPDATE slices SET vms = $1, tipo = 'deployed', timestamp_despliegue = now() WHERE id = $2",
        )
        .bind(&vms_json)
        .bind(slice_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn update_vms(&self, slice_id: i64, vms: Vec<Vm>) -> Result<()> {
        let vms_json = serde_json::to_value(&vms).map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query("UPDATE slices SET vms = $1 WHERE id = $2")
            .bind(&vms_json)
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn set_runtime_state(&self, slice_id: i64, state: Option<RuntimeState>) -> Result<()> {
        let raw = runtime_to_str(state);
        sqlx::query("UPDATE slices SET estado = NULLIF($1, '') WHERE id = $2")
            .bind(raw)
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn delete_slice(&self, slice_id: i64) -> Result<()> {
        sqlx::query("UPDATE slices SET tipo = 'deleted', vlans = '', estado = NULL WHERE id = $1")
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }
}

fn zone_lock_key(zone: Zone) -> i64 {
    match zone {
        Zone::Linux => 0x51_4c_4e_58, // "QLNX"
        Zone::Openstack => 0x51_4f_53, // "QOS"
    }
}

fn row_to_sg(row: &sqlx::postgres::PgRow) -> Result<SecurityGroup> {
    let rules_json: serde_json::Value = row.try_get("rules").map_err(sqlx_err)?;
    Ok(SecurityGroup {
        id: row.try_get("id").map_err(sqlx_err)?,
        slice_id: row.try_get("slice_id").map_err(sqlx_err)?,
        name: row.try_get("name").map_err(sqlx_err)?,
        is_default: row.try_get("is_default").map_err(sqlx_err)?,
        description: row.try_get("description").map_err(sqlx_err)?,
        rules: serde_json::from_value(rules_json).map_err(|e| StoreError::Internal(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(sqlx_err)?,
    })
}

#[async_trait]
impl SecurityGroupStore for PostgresStore {
    async fn create_default_sg(&self, slice_id: i64) -> Result<SecurityGroup> {
        let template = sqlx::query("SELECT rules FROM security_groups WHERE slice_id = 0 AND name = 'default'")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let rules: serde_json::Value = template.try_get("rules").map_err(sqlx_err)?;

        let row = sqlx::query(
            r#"INSERT INTO security_groups (slice_id, name, description, is_default, rules)
               VALUES ($1, 'default', 'default security group', true, $2)
               RETURNING id, slice_id, name, is_default, description, rules, updated_at"#,
        )
        .bind(slice_id)
        .bind(&rules)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        row_to_sg(&row)
    }

    async fn create_custom_sg(
        &self,
        slice_id: i64,
        name: &str,
        description: Option<&str>,
    ) -> Result<SecurityGroup> {
        let row = sqlx::query(
            r#"INSERT INTO security_groups (slice_id, name, description, is_default, rules)
               VALUES ($1, $2, $3, false, '[]')
               RETURNING id, slice_id, name, is_default, description, rules, updated_at"#,
        )
        .bind(slice_id)
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(format!("security group {name:?} already exists for slice {slice_id}"))
            }
            other => sqlx_err(other),
        })?;

        row_to_sg(&row)
    }

    async fn get_sg(&self, id: i64) -> Result<SecurityGroup> {
        let row = sqlx::query("SELECT id, slice_id, name, is_default, description, rules, updated_at FROM security_groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?
            .ok_or_else(|| StoreError::NotFound(format!("security group {id} not found")))?;
        row_to_sg(&row)
    }

    async fn list_sgs(&self, slice_id: i64) -> Result<Vec<SecurityGroup>> {
        let rows = sqlx::query(
            "SELECT id, slice_id, name, is_default, description, rules, updated_at FROM security_groups WHERE slice_id = $1 ORDER BY id",
        )
        .bind(slice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;
        rows.iter().map(row_to_sg).collect()
    }

    async fn add_rule(
        &self,
        sg_id: i64,
        rule: SecurityGroupRule,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SecurityGroup> {
        let mut sg = self.get_sg(sg_id).await?;
        if sg.updated_at != expected_updated_at {
            return Err(StoreError::Conflict(format!(
                "security group {sg_id} was modified concurrently"
            )));
        }
        sg.rules.push(rule);
        let rules_json = serde_json::to_value(&sg.rules).map_err(|e| StoreError::Internal(e.to_string()))?;

        let row = sqlx::query(
            r#"UPDATE security_groups SET rules = $1, updated_at = now()
               WHERE id = $2 AND updated_at = $3
               RETURNING id, slice_id, name, is_default, description, rules, updated_at"#,
        )
        .bind(&rules_json)
        .bind(sg_id)
        .bind(expected_updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?
        .ok_or_else(|| StoreError::Conflict(format!("security group {sg_id} was modified concurrently")))?;

        row_to_sg(&row)
    }

    async fn remove_rule(
        &self,
        sg_id: i64,
        rule_id: u32,
        expected_updated_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<SecurityGroup> {
        let mut sg = self.get_sg(sg_id).await?;
        if sg.updated_at != expected_updated_at {
            return Err(StoreError::Conflict(format!(
                "security group {sg_id} was modified concurrently"
            )));
        }
        if sg.rules.len() <= 1 {
            return Err(StoreError::Conflict("the last rule of a security group may not be removed".into()));
        }
        let before = sg.rules.len();
        sg.rules.retain(|r| r.id != rule_id);
        if sg.rules.len() == before {
            return Err(StoreError::NotFound(format!("rule {rule_id} not found in security group {sg_id}")));
        }
        let rules_json = serde_json::to_value(&sg.rules).map_err(|e| StoreError::Internal(e.to_string()))?;

        let row = sqlx::query(
            r#"UPDATE security_groups SET rules = $1, updated_at = now()
               WHERE id = $2 AND updated_at = $3
               RETURNING id, slice_id, name, is_default, description, rules, updated_at"#,
        )
        .bind(&rules_json)
        .bind(sg_id)
        .bind(expected_updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?
        .ok_or_else(|| StoreError::Conflict(format!("security group {sg_id} was modified concurrently")))?;

        row_to_sg(&row)
    }

    async fn set_rule_foreign_ids(&self, sg_id: i64, foreign_ids: Vec<(u32, String)>) -> Result<()> {
        let mut sg = self.get_sg(sg_id).await?;
        for rule in sg.rules.iter_mut() {
            if let Some((_, fid)) = foreign_ids.iter().find(|(id, _)| *id == rule.id) {
                rule.foreign_id = Some(fid.clone());
            }
        }
        let rules_json = serde_json::to_value(&sg.rules).map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query("UPDATE security_groups SET rules = $1, updated_at = now() WHERE id = $2")
            .bind(&rules_json)
            .bind(sg_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn delete_sg(&self, sg_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM security_groups WHERE id = $1")
            .bind(sg_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }
}

fn image_lifecycle_to_str(l: ImageLifecycle) -> &'static str {
    match l {
        ImageLifecycle::Pending => "pending",
        ImageLifecycle::Validated => "validated",
        ImageLifecycle::Propagated => "propagated",
        ImageLifecycle::Registered => "registered",
    }
}

fn image_lifecycle_from_str(raw: &str) -> ImageLifecycle {
    match raw {
        "validated" => ImageLifecycle::Validated,
        "propagated" => ImageLifecycle::Propagated,
        "registered" => ImageLifecycle::Registered,
        _ => ImageLifecycle::Pending,
    }
}

fn row_to_image(row: &sqlx::postgres::PgRow) -> Result<Image> {
    let import_raw: String = row.try_get("tipo_importacion").map_err(sqlx_err)?;
    let lifecycle_raw: String = row.try_get("lifecycle").map_err(sqlx_err)?;
    Ok(Image {
        id: row.try_get("id").map_err(sqlx_err)?,
        name: row.try_get("nombre").map_err(sqlx_err)?,
        description: row.try_get("descripcion").map_err(sqlx_err)?,
        filename: row.try_get("nombre_imagen").map_err(sqlx_err)?,
        format: row.try_get("formato").map_err(sqlx_err)?,
        size_bytes: row.try_get::<i64, _>("tamano_bytes").map_err(sqlx_err)? as u64,
        import_source: if import_raw == "url" { ImportSource::Url } else { ImportSource::File },
        openstack_id: row.try_get("id_openstack").map_err(sqlx_err)?,
        lifecycle: image_lifecycle_from_str(&lifecycle_raw),
    })
}

#[async_trait]
impl ImageStore for PostgresStore {
    async fn create_image(
        &self,
        name: &str,
        description: Option<&str>,
        filename: &str,
        format: &str,
        size_bytes: u64,
        import_source: ImportSource,
    ) -> Result<Image> {
        let import_str = match import_source {
            ImportSource::Url => "url",
            ImportSource::File => "file",
        };
        let row = sqlx::query(
            r#"INSERT INTO imagenes (nombre, descripcion, nombre_imagen, formato, tamano_bytes, tipo_importacion, lifecycle)
               VALUES ($1, $2, $3, $4, $5, $6, 'pending')
               RETURNING id, nombre, descripcion, nombre_imagen, formato, tamano_bytes, tipo_importacion, id_openstack, lifecycle"#,
        )
        .bind(name)
        .bind(description)
        .bind(filename)
        .bind(format)
        .bind(size_bytes as i64)
        .bind(import_str)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;
        row_to_image(&row)
    }

    async fn get_image(&self, id: i64) -> Result<Image> {
        let row = sqlx::query(
            "SELECT id, nombre, descripcion, nombre_imagen, formato, tamano_bytes, tipo_importacion, id_openstack, lifecycle FROM imagenes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?
        .ok_or_else(|| StoreError::NotFound(format!("image {id} not found")))?;
        row_to_image(&row)
    }

    async fn get_image_by_name(&self, name: &str) -> Result<Image> {
        let row = sqlx::query(
            "SELECT id, nombre, descripcion, nombre_imagen, formato, tamano_bytes, tipo_importacion, id_openstack, lifecycle FROM imagenes WHERE nombre = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_err)?
        .ok_or_else(|| StoreError::NotFound(format!("image {name:?} not found")))?;
        row_to_image(&row)
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let rows = sqlx::query(
            "SELECT id, nombre, descripcion, nombre_imagen, formato, tamano_bytes, tipo_importacion, id_openstack, lifecycle FROM imagenes ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;
        rows.iter().map(row_to_image).collect()
    }

    async fn set_image_lifecycle(&self, id: i64, lifecycle: ImageLifecycle) -> Result<()> {
        sqlx::query("UPDATE imagenes SET lifecycle = $1 WHERE id = $2")
            .bind(image_lifecycle_to_str(lifecycle))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn set_image_openstack_id(&self, id: i64, openstack_id: Option<String>) -> Result<()> {
        sqlx::query("UPDATE imagenes SET id_openstack = $1 WHERE id = $2")
            .bind(openstack_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn set_image_filename(&self, id: i64, filename: &str) -> Result<()> {
        sqlx::query("UPDATE imagenes SET nombre_imagen = $1 WHERE id = $2")
            .bind(filename)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn delete_image(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM imagenes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl VncStore for PostgresStore {
    async fn reserve_displays(&self, slice_id: i64, worker: &str, count: usize) -> Result<Vec<u32>> {
        let mut tx = self.pool.begin().await.map_err(sqlx_err)?;

        sqlx::query("LOCK TABLE vnc_reservations IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        let rows = sqlx::query("SELECT vnc_ports FROM vnc_reservations")
            .fetch_all(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        let mut taken: std::collections::HashSet<u32> = std::collections::HashSet::new();
        for row in &rows {
            let ports_json: serde_json::Value = row.try_get("vnc_ports").map_err(sqlx_err)?;
            let entries: Vec<(String, u32)> =
                serde_json::from_value(ports_json).map_err(|e| StoreError::Internal(e.to_string()))?;
            for (w, display) in entries {
                if w == worker {
                    taken.insert(display);
                }
            }
        }

        let mut allocated = Vec::with_capacity(count);
        let mut candidate = 1u32;
        while candidate <= 1000 && allocated.len() < count {
            if !taken.contains(&candidate) {
                allocated.push(candidate);
            }
            candidate += 1;
        }
        if allocated.len() < count {
            return Err(StoreError::ResourceExhausted(format!(
                "worker {worker} has no more free VNC displays in [1,1000]"
            )));
        }

        let existing = sqlx::query("SELECT vnc_ports FROM vnc_reservations WHERE slice_id = $1")
            .bind(slice_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sqlx_err)?;

        let mut entries: Vec<(String, u32)> = match existing {
            Some(ref row) => {
                let ports_json: serde_json::Value = row.try_get("vnc_ports").map_err(sqlx_err)?;
                serde_json::from_value(ports_json).map_err(|e| StoreError::Internal(e.to_string()))?
            }
            None => Vec::new(),
        };
        entries.extend(allocated.iter().map(|d| (worker.to_string(), *d)));
        let entries_json = serde_json::to_value(&entries).map_err(|e| StoreError::Internal(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO vnc_reservations (slice_id, vnc_ports) VALUES ($1, $2)
               ON CONFLICT (slice_id) DO UPDATE SET vnc_ports = EXCLUDED.vnc_ports"#,
        )
        .bind(slice_id)
        .bind(&entries_json)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;

        tx.commit().await.map_err(sqlx_err)?;
        Ok(allocated)
    }

    async fn release_slice(&self, slice_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM vnc_reservations WHERE slice_id = $1")
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl PlacementStore for PostgresStore {
    async fn assigned_resources(&self, zone: Zone, worker: &str) -> Result<(f64, f64, f64)> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cores), 0) AS cpu, COALESCE(SUM(ram_mb), 0) AS ram_mb, COALESCE(SUM(disk_gb), 0) AS disk_gb
             FROM placement_entries WHERE zona = $1 AND worker = $2",
        )
        .bind(zone.as_str())
        .bind(worker)
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        let cpu: i64 = row.try_get("cpu").map_err(sqlx_err)?;
        let ram_mb: i64 = row.try_get("ram_mb").map_err(sqlx_err)?;
        let disk_gb: i64 = row.try_get("disk_gb").map_err(sqlx_err)?;
        Ok((cpu as f64, ram_mb as f64 / 1024.0, disk_gb as f64))
    }

    async fn add_entry(&self, zone: Zone, worker: &str, entry: PlacementEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO placement_entries (zona, worker, slice_id, vm_name, cores, ram_mb, disk_gb)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (zona, slice_id, vm_name) DO UPDATE SET worker = EXCLUDED.worker"#,
        )
        .bind(zone.as_str())
        .bind(worker)
        .bind(entry.slice_id)
        .bind(&entry.vm_name)
        .bind(entry.cores as i32)
        .bind(entry.ram_mb as i32)
        .bind(entry.disk_gb as i32)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn remove_slice(&self, zone: Zone, slice_id: i64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM placement_entries WHERE zona = $1 AND slice_id = $2")
            .bind(zone.as_str())
            .bind(slice_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_zone(&self, zone: Zone) -> Result<Vec<(String, PlacementEntry)>> {
        let rows = sqlx::query(
            "SELECT worker, slice_id, vm_name, cores, ram_mb, disk_gb FROM placement_entries WHERE zona = $1",
        )
        .bind(zone.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("worker").map_err(sqlx_err)?,
                    PlacementEntry {
                        slice_id: row.try_get("slice_id").map_err(sqlx_err)?,
                        vm_name: row.try_get("vm_name").map_err(sqlx_err)?,
                        cores: row.try_get::<i32, _>("cores").map_err(sqlx_err)? as u32,
                        ram_mb: row.try_get::<i32, _>("ram_mb").map_err(sqlx_err)? as u32,
                        disk_gb: row.try_get::<i32, _>("disk_gb").map_err(sqlx_err)? as u32,
                    },
                ))
            })
            .collect()
    }
}

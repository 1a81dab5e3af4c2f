//! Connection type catalog
//!
//! Maps every known connection type to its category, the fields it requires,
//! and (for HTTP-probed types) the read-only request that proves the target
//! is reachable and accepts the credentials. Adding a type inside an existing
//! category only requires a new row here.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Grouping of connection types sharing a credential shape and probe strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "relational")]
    Relational,
    #[serde(rename = "nosql")]
    NoSql,
    #[serde(rename = "api")]
    Api,
    #[serde(rename = "cloud")]
    Cloud,
    #[serde(rename = "saas")]
    Saas,
    #[serde(rename = "custom")]
    Custom,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Relational => "relational",
            Category::NoSql => "nosql",
            Category::Api => "api",
            Category::Cloud => "cloud",
            Category::Saas => "saas",
            Category::Custom => "custom",
        }
    }
}

/// Known connection types
///
/// Declaration order matches [`CATALOG`] row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    SqlServer,
    MySql,
    PostgreSql,
    MariaDb,
    Oracle,
    MongoDb,
    Redis,
    RestApi,
    GraphQl,
    WebSocket,
    AzureBlobStorage,
    AzureKeyVault,
    AzureServiceBus,
    AwsS3,
    AwsDynamoDb,
    AwsLambda,
    GcpCloudStorage,
    GcpBigQuery,
    GcpPubSub,
    Salesforce,
    ServiceNow,
    HubSpot,
    Stripe,
    Snowflake,
    Databricks,
    Custom,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 26] = [
        ConnectionType::SqlServer,
        ConnectionType::MySql,
        ConnectionType::PostgreSql,
        ConnectionType::MariaDb,
        ConnectionType::Oracle,
        ConnectionType::MongoDb,
        ConnectionType::Redis,
        ConnectionType::RestApi,
        ConnectionType::GraphQl,
        ConnectionType::WebSocket,
        ConnectionType::AzureBlobStorage,
        ConnectionType::AzureKeyVault,
        ConnectionType::AzureServiceBus,
        ConnectionType::AwsS3,
        ConnectionType::AwsDynamoDb,
        ConnectionType::AwsLambda,
        ConnectionType::GcpCloudStorage,
        ConnectionType::GcpBigQuery,
        ConnectionType::GcpPubSub,
        ConnectionType::Salesforce,
        ConnectionType::ServiceNow,
        ConnectionType::HubSpot,
        ConnectionType::Stripe,
        ConnectionType::Snowflake,
        ConnectionType::Databricks,
        ConnectionType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::SqlServer => "sql_server",
            ConnectionType::MySql => "mysql",
            ConnectionType::PostgreSql => "postgresql",
            ConnectionType::MariaDb => "mariadb",
            ConnectionType::Oracle => "oracle",
            ConnectionType::MongoDb => "mongodb",
            ConnectionType::Redis => "redis",
            ConnectionType::RestApi => "rest_api",
            ConnectionType::GraphQl => "graphql",
            ConnectionType::WebSocket => "websocket",
            ConnectionType::AzureBlobStorage => "azure_blob_storage",
            ConnectionType::AzureKeyVault => "azure_key_vault",
            ConnectionType::AzureServiceBus => "azure_service_bus",
            ConnectionType::AwsS3 => "aws_s3",
            ConnectionType::AwsDynamoDb => "aws_dynamodb",
            ConnectionType::AwsLambda => "aws_lambda",
            ConnectionType::GcpCloudStorage => "gcp_cloud_storage",
            ConnectionType::GcpBigQuery => "gcp_bigquery",
            ConnectionType::GcpPubSub => "gcp_pubsub",
            ConnectionType::Salesforce => "salesforce",
            ConnectionType::ServiceNow => "servicenow",
            ConnectionType::HubSpot => "hubspot",
            ConnectionType::Stripe => "stripe",
            ConnectionType::Snowflake => "snowflake",
            ConnectionType::Databricks => "databricks",
            ConnectionType::Custom => "custom",
        }
    }

    /// Category of this type, via the catalog
    pub fn category(&self) -> Category {
        classify(*self).category
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown connection type identifier
#[derive(Debug, Clone, Error, PartialEq)]
#[error("unknown connection type: {0}")]
pub struct UnknownType(pub String);

impl FromStr for ConnectionType {
    type Err = UnknownType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ConnectionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownType(s.to_string()))
    }
}

impl Serialize for ConnectionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConnectionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A field a connection record may need to populate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Server,
    Port,
    Database,
    Username,
    Password,
    ApiKey,
    ClientSecret,
    AccessKeySecret,
    ServiceAccountKey,
    ConnectionString,
    /// Named entry in the record's additional settings
    Setting(&'static str),
}

impl Field {
    pub fn name(&self) -> Cow<'static, str> {
        match self {
            Field::Server => Cow::Borrowed("server"),
            Field::Port => Cow::Borrowed("port"),
            Field::Database => Cow::Borrowed("database"),
            Field::Username => Cow::Borrowed("username"),
            Field::Password => Cow::Borrowed("password"),
            Field::ApiKey => Cow::Borrowed("api_key"),
            Field::ClientSecret => Cow::Borrowed("client_secret"),
            Field::AccessKeySecret => Cow::Borrowed("access_key_secret"),
            Field::ServiceAccountKey => Cow::Borrowed("service_account_key"),
            Field::ConnectionString => Cow::Borrowed("connection_string"),
            Field::Setting(name) => Cow::Owned(format!("setting:{}", name)),
        }
    }

    /// Whether this field is carried by the encrypted secret
    pub fn is_secret(&self) -> bool {
        matches!(
            self,
            Field::Password
                | Field::ApiKey
                | Field::ClientSecret
                | Field::AccessKeySecret
                | Field::ServiceAccountKey
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// HTTP verb used by a table-driven probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

/// Read-only request issued against an HTTP-probed target
///
/// `path` may contain `{server}` and `{<setting>}` placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HttpProbe {
    pub method: HttpMethod,
    pub path: &'static str,
    #[serde(skip)]
    pub headers: &'static [(&'static str, &'static str)],
    #[serde(skip)]
    pub body: Option<&'static str>,
}

/// Cloud provider family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Azure,
    Aws,
    Gcp,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Azure => "azure",
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
        }
    }
}

/// Cloud service row details
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CloudService {
    pub provider: Provider,
    /// Service name (AWS signing name, or a short label)
    pub service: &'static str,
    /// Endpoint template, e.g. `https://{server}.vault.azure.net`
    pub endpoint: &'static str,
    /// OAuth scope requested for token-based auth
    pub scope: &'static str,
    pub probe: HttpProbe,
}

/// How a SaaS product expects the credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaasAuth {
    /// `Authorization: Bearer <api key>`
    Bearer,
    /// HTTP basic with username and password
    Basic,
}

/// SaaS / warehouse row details
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SaasService {
    /// Fixed API host when the product is not tenant-addressed
    pub default_host: Option<&'static str>,
    pub auth: SaasAuth,
    pub probe: HttpProbe,
}

/// One catalog row
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TypeSpec {
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub category: Category,
    pub display_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_port: Option<u16>,
    pub required_fields: &'static [Field],
    pub optional_fields: &'static [Field],
    #[serde(skip)]
    pub cloud: Option<CloudService>,
    #[serde(skip)]
    pub saas: Option<SaasService>,
}

impl TypeSpec {
    pub fn requires(&self, field: Field) -> bool {
        self.required_fields.contains(&field)
    }

    /// Whether the field appears in the required or optional set
    pub fn accepts(&self, field: Field) -> bool {
        self.requires(field) || self.optional_fields.contains(&field)
    }
}

const RELATIONAL_REQUIRED: &[Field] = &[Field::Server, Field::Database, Field::Username, Field::Password];
const API_REQUIRED: &[Field] = &[Field::Server];
const API_OPTIONAL: &[Field] = &[
    Field::ApiKey,
    Field::Setting("auth_header"),
    Field::Setting("health_path"),
];
const AZURE_REQUIRED: &[Field] = &[Field::Server];
const AZURE_OPTIONAL: &[Field] = &[
    Field::Username,
    Field::ClientSecret,
    Field::Setting("tenant_id"),
    Field::Setting("endpoint"),
];
const AWS_REQUIRED: &[Field] = &[Field::Setting("region")];
const AWS_OPTIONAL: &[Field] = &[
    Field::Username,
    Field::AccessKeySecret,
    Field::Setting("endpoint"),
];
const GCP_REQUIRED: &[Field] = &[Field::Setting("project_id")];
const GCP_OPTIONAL: &[Field] = &[Field::ServiceAccountKey, Field::Setting("endpoint")];
const SAAS_HOSTED_REQUIRED: &[Field] = &[Field::Server, Field::ApiKey];
const SAAS_FIXED_REQUIRED: &[Field] = &[Field::ApiKey];
const SAAS_FIXED_OPTIONAL: &[Field] = &[Field::Server];
const NONE: &[Field] = &[];

const fn get(path: &'static str) -> HttpProbe {
    HttpProbe {
        method: HttpMethod::Get,
        path,
        headers: &[],
        body: None,
    }
}

const fn row(
    connection_type: ConnectionType,
    category: Category,
    display_name: &'static str,
    default_port: Option<u16>,
    required_fields: &'static [Field],
    optional_fields: &'static [Field],
) -> TypeSpec {
    TypeSpec {
        connection_type,
        category,
        display_name,
        default_port,
        required_fields,
        optional_fields,
        cloud: None,
        saas: None,
    }
}

const fn cloud_row(
    connection_type: ConnectionType,
    display_name: &'static str,
    required_fields: &'static [Field],
    optional_fields: &'static [Field],
    service: CloudService,
) -> TypeSpec {
    TypeSpec {
        connection_type,
        category: Category::Cloud,
        display_name,
        default_port: None,
        required_fields,
        optional_fields,
        cloud: Some(service),
        saas: None,
    }
}

const fn saas_row(
    connection_type: ConnectionType,
    display_name: &'static str,
    required_fields: &'static [Field],
    optional_fields: &'static [Field],
    service: SaasService,
) -> TypeSpec {
    TypeSpec {
        connection_type,
        category: Category::Saas,
        display_name,
        default_port: None,
        required_fields,
        optional_fields,
        cloud: None,
        saas: Some(service),
    }
}

/// The catalog, one row per [`ConnectionType`] in declaration order
pub static CATALOG: [TypeSpec; 26] = [
    row(
        ConnectionType::SqlServer,
        Category::Relational,
        "SQL Server",
        Some(1433),
        RELATIONAL_REQUIRED,
        &[
            Field::Port,
            Field::Setting("encrypt"),
            Field::Setting("trust_server_certificate"),
        ],
    ),
    row(
        ConnectionType::MySql,
        Category::Relational,
        "MySQL",
        Some(3306),
        RELATIONAL_REQUIRED,
        &[Field::Port, Field::Setting("ssl_mode")],
    ),
    row(
        ConnectionType::PostgreSql,
        Category::Relational,
        "PostgreSQL",
        Some(5432),
        RELATIONAL_REQUIRED,
        &[Field::Port, Field::Setting("ssl_mode")],
    ),
    row(
        ConnectionType::MariaDb,
        Category::Relational,
        "MariaDB",
        Some(3306),
        RELATIONAL_REQUIRED,
        &[Field::Port, Field::Setting("ssl_mode")],
    ),
    row(
        ConnectionType::Oracle,
        Category::Relational,
        "Oracle",
        Some(1521),
        RELATIONAL_REQUIRED,
        &[Field::Port],
    ),
    row(
        ConnectionType::MongoDb,
        Category::NoSql,
        "MongoDB",
        Some(27017),
        &[Field::Server],
        &[
            Field::Port,
            Field::Database,
            Field::Username,
            Field::Password,
            Field::Setting("auth_source"),
            Field::Setting("tls"),
        ],
    ),
    row(
        ConnectionType::Redis,
        Category::NoSql,
        "Redis",
        Some(6379),
        &[Field::Server],
        &[Field::Port, Field::Database, Field::Username, Field::Password],
    ),
    row(
        ConnectionType::RestApi,
        Category::Api,
        "REST API",
        None,
        API_REQUIRED,
        API_OPTIONAL,
    ),
    row(
        ConnectionType::GraphQl,
        Category::Api,
        "GraphQL",
        None,
        API_REQUIRED,
        API_OPTIONAL,
    ),
    row(
        ConnectionType::WebSocket,
        Category::Api,
        "WebSocket",
        None,
        API_REQUIRED,
        API_OPTIONAL,
    ),
    cloud_row(
        ConnectionType::AzureBlobStorage,
        "Azure Blob Storage",
        AZURE_REQUIRED,
        AZURE_OPTIONAL,
        CloudService {
            provider: Provider::Azure,
            service: "blob",
            endpoint: "https://{server}.blob.core.windows.net",
            scope: "https://storage.azure.com/.default",
            probe: HttpProbe {
                method: HttpMethod::Get,
                path: "/?comp=list&maxresults=1",
                headers: &[("x-ms-version", "2021-08-06")],
                body: None,
            },
        },
    ),
    cloud_row(
        ConnectionType::AzureKeyVault,
        "Azure Key Vault",
        AZURE_REQUIRED,
        AZURE_OPTIONAL,
        CloudService {
            provider: Provider::Azure,
            service: "keyvault",
            endpoint: "https://{server}.vault.azure.net",
            scope: "https://vault.azure.net/.default",
            probe: get("/secrets?maxresults=1&api-version=7.4"),
        },
    ),
    cloud_row(
        ConnectionType::AzureServiceBus,
        "Azure Service Bus",
        AZURE_REQUIRED,
        AZURE_OPTIONAL,
        CloudService {
            provider: Provider::Azure,
            service: "servicebus",
            endpoint: "https://{server}.servicebus.windows.net",
            scope: "https://servicebus.azure.net/.default",
            probe: get("/$Resources/Queues?api-version=2021-05&$top=1"),
        },
    ),
    cloud_row(
        ConnectionType::AwsS3,
        "Amazon S3",
        AWS_REQUIRED,
        AWS_OPTIONAL,
        CloudService {
            provider: Provider::Aws,
            service: "s3",
            endpoint: "https://s3.{region}.amazonaws.com",
            scope: "",
            probe: get("/"),
        },
    ),
    cloud_row(
        ConnectionType::AwsDynamoDb,
        "Amazon DynamoDB",
        AWS_REQUIRED,
        AWS_OPTIONAL,
        CloudService {
            provider: Provider::Aws,
            service: "dynamodb",
            endpoint: "https://dynamodb.{region}.amazonaws.com",
            scope: "",
            probe: HttpProbe {
                method: HttpMethod::Post,
                path: "/",
                headers: &[
                    ("content-type", "application/x-amz-json-1.0"),
                    ("x-amz-target", "DynamoDB_20120810.ListTables"),
                ],
                body: Some(r#"{"Limit":1}"#),
            },
        },
    ),
    cloud_row(
        ConnectionType::AwsLambda,
        "AWS Lambda",
        AWS_REQUIRED,
        AWS_OPTIONAL,
        CloudService {
            provider: Provider::Aws,
            service: "lambda",
            endpoint: "https://lambda.{region}.amazonaws.com",
            scope: "",
            probe: get("/2015-03-31/functions/?MaxItems=1"),
        },
    ),
    cloud_row(
        ConnectionType::GcpCloudStorage,
        "Google Cloud Storage",
        GCP_REQUIRED,
        GCP_OPTIONAL,
        CloudService {
            provider: Provider::Gcp,
            service: "storage",
            endpoint: "https://storage.googleapis.com",
            scope: "https://www.googleapis.com/auth/devstorage.read_only",
            probe: get("/storage/v1/b?project={project_id}&maxResults=1"),
        },
    ),
    cloud_row(
        ConnectionType::GcpBigQuery,
        "Google BigQuery",
        GCP_REQUIRED,
        GCP_OPTIONAL,
        CloudService {
            provider: Provider::Gcp,
            service: "bigquery",
            endpoint: "https://bigquery.googleapis.com",
            scope: "https://www.googleapis.com/auth/bigquery.readonly",
            probe: get("/bigquery/v2/projects/{project_id}/datasets?maxResults=1"),
        },
    ),
    cloud_row(
        ConnectionType::GcpPubSub,
        "Google Pub/Sub",
        GCP_REQUIRED,
        GCP_OPTIONAL,
        CloudService {
            provider: Provider::Gcp,
            service: "pubsub",
            endpoint: "https://pubsub.googleapis.com",
            scope: "https://www.googleapis.com/auth/pubsub",
            probe: get("/v1/projects/{project_id}/topics?pageSize=1"),
        },
    ),
    saas_row(
        ConnectionType::Salesforce,
        "Salesforce",
        SAAS_HOSTED_REQUIRED,
        NONE,
        SaasService {
            default_host: None,
            auth: SaasAuth::Bearer,
            probe: get("/services/data/"),
        },
    ),
    saas_row(
        ConnectionType::ServiceNow,
        "ServiceNow",
        &[Field::Server, Field::Username, Field::Password],
        NONE,
        SaasService {
            default_host: None,
            auth: SaasAuth::Basic,
            probe: get("/api/now/table/sys_user?sysparm_limit=1"),
        },
    ),
    saas_row(
        ConnectionType::HubSpot,
        "HubSpot",
        SAAS_FIXED_REQUIRED,
        SAAS_FIXED_OPTIONAL,
        SaasService {
            default_host: Some("api.hubapi.com"),
            auth: SaasAuth::Bearer,
            probe: get("/crm/v3/objects/contacts?limit=1"),
        },
    ),
    saas_row(
        ConnectionType::Stripe,
        "Stripe",
        SAAS_FIXED_REQUIRED,
        SAAS_FIXED_OPTIONAL,
        SaasService {
            default_host: Some("api.stripe.com"),
            auth: SaasAuth::Bearer,
            probe: get("/v1/balance"),
        },
    ),
    saas_row(
        ConnectionType::Snowflake,
        "Snowflake",
        SAAS_HOSTED_REQUIRED,
        NONE,
        SaasService {
            default_host: None,
            auth: SaasAuth::Bearer,
            probe: HttpProbe {
                method: HttpMethod::Post,
                path: "/api/v2/statements",
                headers: &[
                    ("X-Snowflake-Authorization-Token-Type", "OAUTH"),
                    ("Content-Type", "application/json"),
                    ("Accept", "application/json"),
                ],
                body: Some(r#"{"statement":"SELECT 1","timeout":10}"#),
            },
        },
    ),
    saas_row(
        ConnectionType::Databricks,
        "Databricks",
        SAAS_HOSTED_REQUIRED,
        NONE,
        SaasService {
            default_host: None,
            auth: SaasAuth::Bearer,
            probe: get("/api/2.0/preview/scim/v2/Me"),
        },
    ),
    row(
        ConnectionType::Custom,
        Category::Custom,
        "Custom",
        None,
        &[Field::ConnectionString],
        NONE,
    ),
];

/// Look up the catalog row for a type
pub fn classify(connection_type: ConnectionType) -> &'static TypeSpec {
    &CATALOG[connection_type as usize]
}

/// All catalog rows, for informational listings
pub fn all_types() -> &'static [TypeSpec] {
    &CATALOG
}

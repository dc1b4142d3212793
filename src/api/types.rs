//! Bookstore entities, request payloads and the cached value type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
  pub id: String,
  pub title: String,
  pub author: String,
  pub price: f64,
  #[serde(default)]
  pub stock: i64,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub category_id: String,
  #[serde(default)]
  pub category: Option<Category>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
  Pending,
  Paid,
  Cancelled,
  Shipped,
  Delivered,
}

impl OrderStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "PENDING",
      Self::Paid => "PAID",
      Self::Cancelled => "CANCELLED",
      Self::Shipped => "SHIPPED",
      Self::Delivered => "DELIVERED",
    }
  }
}

impl std::str::FromStr for OrderStatus {
  type Err = FetchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "PENDING" => Ok(Self::Pending),
      "PAID" => Ok(Self::Paid),
      "CANCELLED" => Ok(Self::Cancelled),
      "SHIPPED" => Ok(Self::Shipped),
      "DELIVERED" => Ok(Self::Delivered),
      other => Err(FetchError::validation(format!("unknown order status: {other}"))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
  #[serde(default)]
  pub id: String,
  #[serde(default)]
  pub order_id: String,
  pub book_id: String,
  #[serde(default)]
  pub book: Option<Book>,
  pub quantity: i64,
  pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub id: String,
  pub user_id: String,
  #[serde(default)]
  pub user: Option<User>,
  pub status: OrderStatus,
  #[serde(default)]
  pub total_price: f64,
  #[serde(default)]
  pub items: Vec<OrderItem>,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
  Pending,
  Success,
  Failed,
  Cancelled,
}

impl TransactionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "PENDING",
      Self::Success => "SUCCESS",
      Self::Failed => "FAILED",
      Self::Cancelled => "CANCELLED",
    }
  }
}

impl std::str::FromStr for TransactionStatus {
  type Err = FetchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "PENDING" => Ok(Self::Pending),
      "SUCCESS" => Ok(Self::Success),
      "FAILED" => Ok(Self::Failed),
      "CANCELLED" => Ok(Self::Cancelled),
      other => Err(FetchError::validation(format!(
        "unknown transaction status: {other}"
      ))),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
  Esewa,
  Cash,
  Card,
}

impl std::str::FromStr for PaymentMethod {
  type Err = FetchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "ESEWA" => Ok(Self::Esewa),
      "CASH" => Ok(Self::Cash),
      "CARD" => Ok(Self::Card),
      other => Err(FetchError::validation(format!("unknown payment method: {other}"))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: String,
  pub order_id: String,
  #[serde(default)]
  pub user_id: String,
  pub payment_method: PaymentMethod,
  /// External (gateway) transaction id
  #[serde(default)]
  pub transaction_id: String,
  pub amount: f64,
  pub status: TransactionStatus,
  #[serde(default)]
  pub payment_url: String,
  #[serde(default)]
  pub merchant_code: String,
  #[serde(default)]
  pub product_code: String,
  #[serde(default)]
  pub product_name: String,
  #[serde(default)]
  pub esewa_response: Option<serde_json::Value>,
  #[serde(default)]
  pub failure_reason: String,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl Transaction {
  pub fn is_pending(&self) -> bool {
    self.status == TransactionStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == TransactionStatus::Success
  }

  pub fn is_failed(&self) -> bool {
    self.status == TransactionStatus::Failed
  }

  /// Failed and cancelled payments may be attempted again.
  pub fn can_retry(&self) -> bool {
    matches!(
      self.status,
      TransactionStatus::Failed | TransactionStatus::Cancelled
    )
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  pub name: String,
  pub email: String,
  #[serde(default)]
  pub role: String,
  #[serde(default)]
  pub created_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

impl User {
  pub fn is_admin(&self) -> bool {
    self.role.eq_ignore_ascii_case("admin")
  }
}

/// Aggregates over a list of transactions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionStats {
  pub total: usize,
  pub pending: usize,
  pub success: usize,
  pub failed: usize,
  pub cancelled: usize,
  pub total_amount: f64,
  pub success_amount: f64,
}

impl TransactionStats {
  pub fn from_transactions(transactions: &[Transaction]) -> Self {
    transactions.iter().fold(Self::default(), |mut stats, t| {
      stats.total += 1;
      stats.total_amount += t.amount;
      match t.status {
        TransactionStatus::Pending => stats.pending += 1,
        TransactionStatus::Success => {
          stats.success += 1;
          stats.success_amount += t.amount;
        }
        TransactionStatus::Failed => stats.failed += 1,
        TransactionStatus::Cancelled => stats.cancelled += 1,
      }
      stats
    })
  }

  /// Share of successful transactions in percent, 0 when there are none.
  pub fn success_rate(&self) -> f64 {
    if self.total == 0 {
      return 0.0;
    }
    self.success as f64 * 100.0 / self.total as f64
  }
}

// ============================================================================
// Request payloads
// ============================================================================

fn require(value: &str, field: &str) -> Result<(), FetchError> {
  if value.trim().is_empty() {
    return Err(FetchError::validation(format!("{field} is required")));
  }
  Ok(())
}

fn non_negative(value: f64, field: &str) -> Result<(), FetchError> {
  if !value.is_finite() || value < 0.0 {
    return Err(FetchError::validation(format!(
      "{field} must not be negative"
    )));
  }
  Ok(())
}

/// Body of `POST /books` and `PUT /books/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookRequest {
  pub title: String,
  pub author: String,
  pub price: f64,
  pub stock: i64,
  #[serde(skip_serializing_if = "String::is_empty")]
  pub description: String,
  pub category_id: String,
}

impl BookRequest {
  pub fn validate(&self) -> Result<(), FetchError> {
    require(&self.title, "title")?;
    require(&self.author, "author")?;
    require(&self.category_id, "category")?;
    non_negative(self.price, "price")?;
    if self.stock < 0 {
      return Err(FetchError::validation("stock must not be negative"));
    }
    Ok(())
  }
}

/// Body of `POST /categories` and `PUT /categories/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryRequest {
  pub name: String,
}

impl CategoryRequest {
  pub fn validate(&self) -> Result<(), FetchError> {
    require(&self.name, "category name")
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItemRequest {
  pub book_id: String,
  pub quantity: i64,
  pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateOrderRequest {
  pub items: Vec<OrderItemRequest>,
}

impl CreateOrderRequest {
  pub fn validate(&self) -> Result<(), FetchError> {
    if self.items.is_empty() {
      return Err(FetchError::validation("an order needs at least one item"));
    }
    for item in &self.items {
      require(&item.book_id, "book")?;
      if item.quantity <= 0 {
        return Err(FetchError::validation(format!(
          "quantity for book {} must be positive",
          item.book_id
        )));
      }
      non_negative(item.price, "price")?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UpdateOrderStatusRequest {
  pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTransactionRequest {
  pub order_id: String,
  pub payment_method: PaymentMethod,
  pub amount: f64,
}

impl CreateTransactionRequest {
  pub fn validate(&self) -> Result<(), FetchError> {
    require(&self.order_id, "order")?;
    if !self.amount.is_finite() || self.amount <= 0.0 {
      return Err(FetchError::validation("amount must be positive"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionUpdateRequest {
  pub status: TransactionStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub transaction_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure_reason: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub esewa_response: Option<String>,
}

impl TransactionUpdateRequest {
  pub fn status(status: TransactionStatus) -> Self {
    Self {
      status,
      transaction_id: None,
      failure_reason: None,
      esewa_response: None,
    }
  }
}

/// Body of `POST /transactions/esewa/initiate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EsewaPaymentRequest {
  pub amount: f64,
  pub tax_amount: f64,
  pub product_code: String,
  pub product_name: String,
  pub product_service_charge: f64,
  pub product_delivery_charge: f64,
  pub success_url: String,
  pub failure_url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signed_field_names: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub signature: Option<String>,
}

impl EsewaPaymentRequest {
  pub fn validate(&self) -> Result<(), FetchError> {
    if !self.amount.is_finite() || self.amount < 0.01 {
      return Err(FetchError::validation("amount must be at least 0.01"));
    }
    non_negative(self.tax_amount, "tax amount")?;
    non_negative(self.product_service_charge, "service charge")?;
    non_negative(self.product_delivery_charge, "delivery charge")?;
    require(&self.product_code, "product code")?;
    require(&self.product_name, "product name")?;
    absolute_url(&self.success_url, "success url")?;
    absolute_url(&self.failure_url, "failure url")?;
    Ok(())
  }
}

fn absolute_url(value: &str, field: &str) -> Result<(), FetchError> {
  match url::Url::parse(value) {
    Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
    Ok(url) => Err(FetchError::validation(format!(
      "{field} has unsupported scheme {}",
      url.scheme()
    ))),
    Err(err) => Err(FetchError::validation(format!("{field} is not a valid URL: {err}"))),
  }
}

/// Gateway callback data posted to `POST /transactions/esewa/verify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsewaResponseData {
  pub transaction_code: String,
  pub status: String,
  pub total_amount: String,
  pub product_code: String,
  pub ref_id: String,
  #[serde(default)]
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub signed_field_names: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginRequest {
  pub email: String,
  pub password: String,
}

impl LoginRequest {
  pub fn validate(&self) -> Result<(), FetchError> {
    require(&self.email, "email")?;
    require(&self.password, "password")
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
  pub token: String,
}

// ============================================================================
// Cached values
// ============================================================================

/// Everything the bookstore cache can hold, one variant per resource shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
  Books(Vec<Book>),
  Book(Book),
  Categories(Vec<Category>),
  Category(Category),
  Orders(Vec<Order>),
  Order(Order),
  Transactions(Vec<Transaction>),
  Transaction(Transaction),
  /// `None` when nobody is signed in
  CurrentUser(Option<User>),
}

/// Conversion between a typed value and its [`Resource`] variant.
pub trait CacheValue: Clone + Send + Sync + 'static {
  fn into_resource(self) -> Resource;
  fn from_resource(resource: &Resource) -> Option<&Self>;
}

macro_rules! cache_value {
  ($($ty:ty => $variant:ident),* $(,)?) => {
    $(
      impl CacheValue for $ty {
        fn into_resource(self) -> Resource {
          Resource::$variant(self)
        }

        fn from_resource(resource: &Resource) -> Option<&Self> {
          match resource {
            Resource::$variant(value) => Some(value),
            _ => None,
          }
        }
      }
    )*
  };
}

cache_value! {
  Vec<Book> => Books,
  Book => Book,
  Vec<Category> => Categories,
  Category => Category,
  Vec<Order> => Orders,
  Order => Order,
  Vec<Transaction> => Transactions,
  Transaction => Transaction,
  Option<User> => CurrentUser,
}

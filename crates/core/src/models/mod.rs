//! # 数据模型
//!
//! 编排核心的领域模型：任务、执行计划、Worker 与事件。
//!
//! 状态类字段以小写文本存入 SQLite，时间字段以毫秒时间戳存储，
//! 在仓储层与 `DateTime<Utc>` 互转。

/// 为以文本存储的状态枚举实现 SQLite 编解码
macro_rules! sqlite_text_enum {
    ($ty:ty, $label:literal) => {
        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                s.parse::<$ty>()
                    .map_err(|_| format!(concat!("Invalid ", $label, ": {}"), s).into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }
    };
}

pub mod event;
pub mod plan;
pub mod task;
pub mod worker;

pub use event::*;
pub use plan::*;
pub use task::*;
pub use worker::*;

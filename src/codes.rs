//! Well-known classifier codes, seeded by the schema migration (§4.1).

pub const CLASSIFIER_SECTION: &str = "inventory_section";
pub const CLASSIFIER_OPERATION_TYPE: &str = "operation_type";

pub const SECTION_MAIN: &str = "main";
pub const SECTION_FACTORY: &str = "factory";
pub const SECTION_TRADE: &str = "trade";

pub const OP_CHEST_REWARD: &str = "chest_reward";
pub const OP_FACTORY_RESERVATION: &str = "factory_reservation";
pub const OP_FACTORY_RETURN: &str = "factory_return";
pub const OP_FACTORY_CONSUMPTION: &str = "factory_consumption";
pub const OP_CRAFT_RESULT: &str = "craft_result";
pub const OP_ADMIN_ADJUSTMENT: &str = "admin_adjustment";

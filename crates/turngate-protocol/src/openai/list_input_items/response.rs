use crate::openai::list_input_items::types::ResponseItemList;

pub type ListInputItemsResponse = ResponseItemList;

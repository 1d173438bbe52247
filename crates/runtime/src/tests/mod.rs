mod group_test;
